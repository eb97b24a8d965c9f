use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};

use crate::config::FieldModelConfig;

/// 入力 (x, y, z, t) の値域。各成分を [-1, 1] に正規化するのに使います。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputBounds {
    pub lower: [f64; 4],
    pub upper: [f64; 4],
}

impl InputBounds {
    /// 半径 `radius`、長さ `length` の軸と時間区間 [t_start, t_end] を覆う値域。
    pub fn for_shaft(radius: f64, length: f64, t_start: f64, t_end: f64) -> Self {
        Self {
            lower: [-radius, -radius, 0.0, t_start],
            upper: [radius, radius, length, t_end],
        }
    }

    fn center(&self) -> [f64; 4] {
        std::array::from_fn(|i| 0.5 * (self.lower[i] + self.upper[i]))
    }

    /// 正規化の倍率 2 / (upper - lower)。幅がゼロの成分は倍率1とします。
    fn inverse_half_range(&self) -> [f64; 4] {
        std::array::from_fn(|i| {
            let half = 0.5 * (self.upper[i] - self.lower[i]);
            if half > 0.0 { 1.0 / half } else { 1.0 }
        })
    }
}

/// 入力の正規化と出力の温度範囲。学習対象ではないのでレコードには含めません。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldScaling {
    pub inputs: InputBounds,
    pub temperature_min: f64,
    pub temperature_max: f64,
}

impl FieldScaling {
    pub fn new(inputs: InputBounds, config: &FieldModelConfig) -> Self {
        Self {
            inputs,
            temperature_min: config.temperature_min,
            temperature_max: config.temperature_max,
        }
    }
}

/// 任意の (x, y, z, t) で温度を返す場。
pub trait TemperatureField<B: Backend> {
    /// `coords` [N, 4] に対する温度 [N, 1]。
    fn temperature(&self, coords: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// 場の値と入力に関する微分。
#[derive(Debug, Clone)]
pub struct FieldJet<B: Backend> {
    /// [N, 1]
    pub value: Tensor<B, 2>,
    /// [N, 4]: ∂T/∂x, ∂T/∂y, ∂T/∂z, ∂T/∂t（入力の単位あたり）
    pub gradient: Tensor<B, 2>,
    /// [N, 1]: ∂²T/∂x² + ∂²T/∂y² + ∂²T/∂z²
    pub laplacian: Tensor<B, 2>,
}

/// 空間2階・時間1階までの微分を計算できる場。
///
/// 微分はパラメータについて微分可能なテンソル演算で返す必要があります。
/// autodiffバックエンド上では、残差から各重みへ逆伝播できます。
pub trait DifferentiableField<B: Backend>: TemperatureField<B> {
    fn jet(&self, coords: Tensor<B, 2>) -> FieldJet<B>;
}

/// PINNの本体となるニューラルネットワークモデル。
///
/// 座標(x, y, z, t)を入力とし、その点における温度Tを予測する多層パーセプトロン（MLP）です。
/// 出力はシグモイドで飽和させたのち [T_min, T_max] に線形変換します。
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Tanh,
    scaling: Ignored<FieldScaling>,
}

impl<B: Backend> Model<B> {
    /// 新しいモデルを初期化します。
    pub fn new(config: &FieldModelConfig, scaling: FieldScaling, device: &B::Device) -> Self {
        let n_hidden = config.hidden_size;
        let n_layers = config.num_layers.max(2);
        let mut linears = Vec::with_capacity(n_layers);
        linears.push(LinearConfig::new(4, n_hidden).init(device));
        for _ in 1..(n_layers - 1) {
            linears.push(LinearConfig::new(n_hidden, n_hidden).init(device));
        }
        linears.push(LinearConfig::new(n_hidden, 1).init(device));
        Self {
            linears,
            activation: Tanh::new(),
            scaling: Ignored(scaling),
        }
    }

    pub fn scaling(&self) -> FieldScaling {
        self.scaling.0
    }

    /// モデルの順伝播を実行します。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = self.normalize(input);
        let last = self.linears.len() - 1;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last {
                x = self.activation.forward(x);
            }
        }
        self.to_temperature(sigmoid(x))
    }

    fn normalize(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = input.device();
        let bounds = self.scaling.0.inputs;
        let center = row_tensor::<B>(bounds.center(), &device);
        let scale = row_tensor::<B>(bounds.inverse_half_range(), &device);
        (input - center) * scale
    }

    fn temperature_span(&self) -> f32 {
        let scaling = self.scaling.0;
        (scaling.temperature_max - scaling.temperature_min) as f32
    }

    fn to_temperature(&self, squashed: Tensor<B, 2>) -> Tensor<B, 2> {
        squashed
            .mul_scalar(self.temperature_span())
            .add_scalar(self.scaling.0.temperature_min as f32)
    }
}

impl<B: Backend> TemperatureField<B> for Model<B> {
    fn temperature(&self, coords: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(coords)
    }
}

impl<B: Backend> DifferentiableField<B> for Model<B> {
    /// 各層を通して1階・2階微分を前進モードで伝播させます。
    ///
    /// 線形層 a = hW + b では ∂a = ∂h W、tanh s = tanh(a) では
    /// ∂s = s' ∂a、∂²s = s' ∂²a + s'' (∂a)²（s' = 1 - s², s'' = -2 s s'）。
    fn jet(&self, coords: Tensor<B, 2>) -> FieldJet<B> {
        let [n, _] = coords.dims();
        let device = coords.device();
        let scale = self.scaling.0.inputs.inverse_half_range();

        let mut h = self.normalize(coords);
        // d1[a] = ∂h/∂入力a (a = x, y, z, t), d2[a] = ∂²h/∂入力a² (a = x, y, z)
        let mut d1: Vec<Tensor<B, 2>> = (0..4)
            .map(|axis| axis_seed::<B>(n, axis, scale[axis], &device))
            .collect();
        let mut d2: Vec<Tensor<B, 2>> = (0..3).map(|_| Tensor::zeros([n, 4], &device)).collect();

        let last = self.linears.len() - 1;
        for (i, linear) in self.linears.iter().enumerate() {
            let weight = linear.weight.val();
            let a = linear.forward(h);
            let da: Vec<Tensor<B, 2>> = d1.into_iter().map(|d| d.matmul(weight.clone())).collect();
            let dda: Vec<Tensor<B, 2>> = d2.into_iter().map(|d| d.matmul(weight.clone())).collect();

            if i == last {
                h = a;
                d1 = da;
                d2 = dda;
            } else {
                let s = self.activation.forward(a);
                let ds = (s.clone() * s.clone()).neg().add_scalar(1.0);
                let dds = (s.clone() * ds.clone()).mul_scalar(-2.0);
                d2 = dda
                    .into_iter()
                    .zip(da.iter())
                    .map(|(dd, d)| ds.clone() * dd + dds.clone() * square(d.clone()))
                    .collect();
                d1 = da.into_iter().map(|d| ds.clone() * d).collect();
                h = s;
            }
        }

        // 出力変換 T = T_min + span·σ(u)
        let span = self.temperature_span();
        let sig = sigmoid(h);
        let dsig = sig.clone() * sig.clone().neg().add_scalar(1.0);
        let ddsig = dsig.clone() * sig.clone().mul_scalar(-2.0).add_scalar(1.0);

        let laplacian = d2
            .into_iter()
            .zip(d1.iter())
            .map(|(dd, d)| dsig.clone() * dd + ddsig.clone() * square(d.clone()))
            .fold(Tensor::zeros([n, 1], &device), |acc, term| acc + term)
            .mul_scalar(span);
        let gradient = Tensor::cat(
            d1.into_iter().map(|d| dsig.clone() * d).collect::<Vec<_>>(),
            1,
        )
        .mul_scalar(span);

        FieldJet {
            value: self.to_temperature(sig),
            gradient,
            laplacian,
        }
    }
}

fn square<B: Backend>(tensor: Tensor<B, 2>) -> Tensor<B, 2> {
    tensor.clone() * tensor
}

fn row_tensor<B: Backend>(values: [f64; 4], device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_floats(values.map(|v| v as f32), device).reshape([1, 4])
}

/// 入力軸 `axis` 方向の微分の初期値（正規化の倍率だけを持つ [N, 4]）。
fn axis_seed<B: Backend>(n: usize, axis: usize, scale: f64, device: &B::Device) -> Tensor<B, 2> {
    let mut seed = vec![0.0f32; n * 4];
    for row in seed.chunks_exact_mut(4) {
        row[axis] = scale as f32;
    }
    Tensor::<B, 1>::from_floats(seed.as_slice(), device).reshape([n, 4])
}
