use burn::prelude::Backend;
use burn::tensor::Tensor;

use crate::config::{BoundaryConfig, GeometryConfig, MaterialConfig};
use crate::geometry::BoundaryRegion;
use crate::model::DifferentiableField;

/// 支配方程式と境界条件の残差を計算します。
///
/// 呼び出しごとに独立しており、保持するのは定数だけです。
#[derive(Debug, Clone)]
pub struct ResidualEngine {
    material: MaterialConfig,
    boundaries: BoundaryConfig,
    /// 1座標単位あたりのメートル数
    length_unit: f64,
}

impl ResidualEngine {
    pub fn new(
        material: &MaterialConfig,
        boundaries: &BoundaryConfig,
        geometry: &GeometryConfig,
    ) -> Self {
        Self {
            material: material.clone(),
            boundaries: boundaries.clone(),
            length_unit: geometry.length_unit,
        }
    }

    /// 内部の残差 r = ρc_p ∂T/∂t - k ∇²T [N, 1]。
    pub fn pde_residual<B: Backend, F: DifferentiableField<B>>(
        &self,
        field: &F,
        coords: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [n, _] = coords.dims();
        let jet = field.jet(coords);
        let dt = jet.gradient.slice([0..n, 3..4]);
        let laplacian = jet
            .laplacian
            .mul_scalar((1.0 / (self.length_unit * self.length_unit)) as f32);
        dt.mul_scalar(self.material.heat_capacity() as f32)
            - laplacian.mul_scalar(self.material.conductivity as f32)
    }

    /// 境界の残差 [N, 1]。`normals` [N, 3] は各点の外向き単位法線です。
    ///
    /// - End: r = k ∂T/∂n - (q_n - h (T - T∞))
    /// - Step, Side: r = k ∂T/∂n + h (T - T∞)
    pub fn boundary_residual<B: Backend, F: DifferentiableField<B>>(
        &self,
        field: &F,
        region: BoundaryRegion,
        coords: Tensor<B, 2>,
        normals: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [n, _] = coords.dims();
        let jet = field.jet(coords);
        let normal_derivative = (jet.gradient.slice([0..n, 0..3]) * normals)
            .sum_dim(1)
            .mul_scalar((1.0 / self.length_unit) as f32);
        let conduction = normal_derivative.mul_scalar(self.material.conductivity as f32);

        match region {
            BoundaryRegion::End => {
                let end = self.boundaries.end;
                let convection = jet
                    .value
                    .sub_scalar(end.ambient as f32)
                    .mul_scalar(end.heat_transfer as f32);
                conduction + convection.sub_scalar(end.heat_flux as f32)
            }
            BoundaryRegion::Step | BoundaryRegion::Side => {
                let bc = if region == BoundaryRegion::Step {
                    self.boundaries.step
                } else {
                    self.boundaries.side
                };
                let convection = jet
                    .value
                    .sub_scalar(bc.ambient as f32)
                    .mul_scalar(bc.heat_transfer as f32);
                conduction + convection
            }
        }
    }
}
