//! 段付き軸の幾何による節点の領域分類。
//!
//! 判定の優先順位は End > Step > Side > Domain です。セグメント境界では
//! 複数の規則が同時に当てはまるため、この順序がどの境界条件を課すかを決めます。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GeometryConfig;
use crate::data::Node;
use crate::error::{PinnError, PinnResult};

/// 節点が属する物理領域。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    Domain,
    End,
    Step,
    Side,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Domain, Region::End, Region::Step, Region::Side];

    pub fn boundary(&self) -> Option<BoundaryRegion> {
        match self {
            Region::Domain => None,
            Region::End => Some(BoundaryRegion::End),
            Region::Step => Some(BoundaryRegion::Step),
            Region::Side => Some(BoundaryRegion::Side),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Region::Domain => "domain",
            Region::End => "end",
            Region::Step => "step",
            Region::Side => "side",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 境界条件を持つ領域。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryRegion {
    End,
    Step,
    Side,
}

impl BoundaryRegion {
    pub const ALL: [BoundaryRegion; 3] =
        [BoundaryRegion::End, BoundaryRegion::Step, BoundaryRegion::Side];

    pub fn kind(&self) -> BoundaryKind {
        match self {
            BoundaryRegion::End => BoundaryKind::RobinFlux,
            BoundaryRegion::Step | BoundaryRegion::Side => BoundaryKind::Convective,
        }
    }

    pub fn region(&self) -> Region {
        match self {
            BoundaryRegion::End => Region::End,
            BoundaryRegion::Step => Region::Step,
            BoundaryRegion::Side => Region::Side,
        }
    }
}

/// 境界条件の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// 熱流束項付きのRobin条件
    RobinFlux,
    /// 純粋な対流Robin条件
    Convective,
}

/// 分類済みの節点。境界節点は外向き単位法線を持ちます。
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedNode {
    pub node: Node,
    pub region: Region,
    pub normal: Option<[f64; 3]>,
}

/// セグメントの切り替わり面（段差）。
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    z: f64,
    inner_radius: f64,
    outer_radius: f64,
    /// 段差面の外向き法線のz成分（±1）
    normal_z: f64,
}

/// 段付き軸の幾何に基づいて節点を分類します。
#[derive(Debug, Clone)]
pub struct GeometryClassifier {
    /// 各セグメントの (開始z, 終了z, 半径)
    segments: Vec<(f64, f64, f64)>,
    transitions: Vec<Transition>,
    total_length: f64,
    epsilon: f64,
}

impl GeometryClassifier {
    pub fn new(config: &GeometryConfig) -> PinnResult<Self> {
        if config.segments.is_empty() {
            return Err(PinnError::Config("shaft needs at least one segment".into()));
        }
        if !(config.epsilon.is_finite() && config.epsilon > 0.0) {
            return Err(PinnError::Config("geometry.epsilon must be positive".into()));
        }

        let mut segments = Vec::with_capacity(config.segments.len());
        let mut start = 0.0;
        for segment in &config.segments {
            if !(segment.length > 0.0 && segment.radius > 0.0) {
                return Err(PinnError::Config(format!(
                    "segment must have positive length and radius, got {:?}",
                    segment
                )));
            }
            segments.push((start, start + segment.length, segment.radius));
            start += segment.length;
        }

        let transitions = segments
            .windows(2)
            .filter(|pair| pair[0].2 != pair[1].2)
            .map(|pair| {
                let (below, above) = (pair[0].2, pair[1].2);
                Transition {
                    z: pair[0].1,
                    inner_radius: below.min(above),
                    outer_radius: below.max(above),
                    // 太くなる段差の露出面は -z を向く
                    normal_z: if above > below { -1.0 } else { 1.0 },
                }
            })
            .collect();

        Ok(Self {
            segments,
            transitions,
            total_length: start,
            epsilon: config.epsilon,
        })
    }

    pub fn total_length(&self) -> f64 {
        self.total_length
    }

    pub fn max_radius(&self) -> f64 {
        self.segments.iter().map(|s| s.2).fold(0.0, f64::max)
    }

    pub fn has_steps(&self) -> bool {
        !self.transitions.is_empty()
    }

    /// 1節点を分類し、境界節点なら外向き法線も返します。
    pub fn classify(&self, node: &Node) -> PinnResult<(Region, Option<[f64; 3]>)> {
        let eps = self.epsilon;
        let (r, z) = (node.radius(), node.z);

        if z < -eps || z > self.total_length + eps {
            return Err(self.error(node, format!("z lies outside [0, {}]", self.total_length)));
        }
        let allowed = self.allowed_radius(z);
        if r > allowed + eps {
            return Err(self.error(
                node,
                format!("radius {r:.4} exceeds the local outer radius {allowed}"),
            ));
        }

        if z.abs() <= eps {
            return Ok((Region::End, Some([0.0, 0.0, -1.0])));
        }
        if (z - self.total_length).abs() <= eps {
            return Ok((Region::End, Some([0.0, 0.0, 1.0])));
        }

        for step in &self.transitions {
            if (z - step.z).abs() <= eps
                && r >= step.inner_radius - eps
                && r <= step.outer_radius + eps
            {
                return Ok((Region::Step, Some([0.0, 0.0, step.normal_z])));
            }
        }

        if (r - self.segment_radius(z)).abs() <= eps && r > 0.0 {
            return Ok((Region::Side, Some([node.x / r, node.y / r, 0.0])));
        }

        Ok((Region::Domain, None))
    }

    /// 全節点を分類します。1つでも分類できない節点があれば失敗します。
    pub fn classify_all(&self, nodes: &[Node]) -> PinnResult<ClassifiedMesh> {
        let nodes = nodes
            .iter()
            .map(|node| {
                self.classify(node).map(|(region, normal)| ClassifiedNode {
                    node: node.clone(),
                    region,
                    normal,
                })
            })
            .collect::<PinnResult<Vec<_>>>()?;
        let mesh = ClassifiedMesh {
            nodes,
            has_steps: self.has_steps(),
        };
        tracing::info!(
            "節点を分類しました: domain={} end={} step={} side={}",
            mesh.count(Region::Domain),
            mesh.count(Region::End),
            mesh.count(Region::Step),
            mesh.count(Region::Side)
        );
        Ok(mesh)
    }

    /// z位置で許容される最大半径。段差面では太い側の半径を許します。
    fn allowed_radius(&self, z: f64) -> f64 {
        let near_step = self
            .transitions
            .iter()
            .filter(|step| (z - step.z).abs() <= self.epsilon)
            .map(|step| step.outer_radius)
            .fold(f64::NEG_INFINITY, f64::max);
        near_step.max(self.segment_radius(z))
    }

    fn segment_radius(&self, z: f64) -> f64 {
        self.segments
            .iter()
            .find(|(_, end, _)| z <= *end)
            .or(self.segments.last())
            .map(|s| s.2)
            .unwrap_or(0.0)
    }

    fn error(&self, node: &Node, reason: String) -> PinnError {
        PinnError::Classification {
            instance: node.instance.clone(),
            node_id: node.node_id,
            x: node.x,
            y: node.y,
            z: node.z,
            reason,
        }
    }
}

/// 分類済みの全節点。
#[derive(Debug, Clone)]
pub struct ClassifiedMesh {
    nodes: Vec<ClassifiedNode>,
    has_steps: bool,
}

impl ClassifiedMesh {
    pub fn nodes(&self) -> &[ClassifiedNode] {
        &self.nodes
    }

    pub fn has_steps(&self) -> bool {
        self.has_steps
    }

    pub fn count(&self, region: Region) -> usize {
        self.nodes.iter().filter(|n| n.region == region).count()
    }

    pub fn in_region(&self, region: Region) -> impl Iterator<Item = &ClassifiedNode> + '_ {
        self.nodes.iter().filter(move |n| n.region == region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(x: f64, y: f64, z: f64) -> Node {
        Node {
            node_id: 1,
            instance: "PART-1-1".into(),
            x,
            y,
            z,
        }
    }

    fn classifier() -> GeometryClassifier {
        GeometryClassifier::new(&GeometryConfig::new()).unwrap()
    }

    #[test]
    fn ends_have_axial_outward_normals() {
        let c = classifier();
        assert_eq!(
            c.classify(&node(0.0, 0.0, 0.0)).unwrap(),
            (Region::End, Some([0.0, 0.0, -1.0]))
        );
        assert_eq!(
            c.classify(&node(0.0, 0.0, 1000.0)).unwrap(),
            (Region::End, Some([0.0, 0.0, 1.0]))
        );
    }

    #[test]
    fn step_corner_wins_over_side() {
        let c = classifier();
        let (region, normal) = c.classify(&node(25.0, 0.0, 150.0)).unwrap();
        assert_eq!(region, Region::Step);
        // 150 で φ50 → φ70 に太くなるので段差面は -z を向く
        assert_eq!(normal, Some([0.0, 0.0, -1.0]));

        let (region, normal) = c.classify(&node(0.0, 30.0, 850.0)).unwrap();
        assert_eq!(region, Region::Step);
        assert_eq!(normal, Some([0.0, 0.0, 1.0]));
    }

    #[test]
    fn end_wins_over_side_at_rim() {
        let c = classifier();
        let (region, _) = c.classify(&node(25.0, 0.0, 0.0)).unwrap();
        assert_eq!(region, Region::End);
    }

    #[test]
    fn side_normal_is_radial_unit_vector() {
        let c = classifier();
        let x = 35.0 * 0.6;
        let y = 35.0 * 0.8;
        let (region, normal) = c.classify(&node(x, y, 500.0)).unwrap();
        assert_eq!(region, Region::Side);
        let n = normal.unwrap();
        assert!((n[0] - 0.6).abs() < 1e-12 && (n[1] - 0.8).abs() < 1e-12 && n[2] == 0.0);
    }

    #[test]
    fn interior_and_inner_step_plane_are_domain() {
        let c = classifier();
        assert_eq!(c.classify(&node(10.0, 0.0, 400.0)).unwrap().0, Region::Domain);
        // 段差面上でも細い側の半径より内側は内部
        assert_eq!(c.classify(&node(5.0, 5.0, 150.0)).unwrap().0, Region::Domain);
    }

    #[test]
    fn epsilon_band_absorbs_noise() {
        let c = classifier();
        assert_eq!(c.classify(&node(0.0, 0.0, 0.3)).unwrap().0, Region::End);
        assert_eq!(c.classify(&node(35.2, 0.0, 500.0)).unwrap().0, Region::Side);
    }

    #[test]
    fn radius_outside_segment_is_an_error() {
        let c = classifier();
        // 細いセグメントで太いセグメントの半径を持つ節点
        let err = c.classify(&node(35.0, 0.0, 50.0)).unwrap_err();
        assert!(matches!(err, PinnError::Classification { .. }));
        assert!(c.classify(&node(0.0, 0.0, 1010.0)).is_err());
    }

    #[test]
    fn uniform_shaft_has_no_steps() {
        let config = GeometryConfig::new().with_segments(vec![
            crate::config::ShaftSegment { length: 100.0, radius: 10.0 },
            crate::config::ShaftSegment { length: 100.0, radius: 10.0 },
        ]);
        let c = GeometryClassifier::new(&config).unwrap();
        assert!(!c.has_steps());
        assert_eq!(c.classify(&node(10.0, 0.0, 100.0)).unwrap().0, Region::Side);
    }

    #[test]
    fn every_node_on_a_grid_gets_one_region_with_outward_normal() {
        let c = classifier();
        for iz in 0..=100 {
            let z = iz as f64 * 10.0;
            let radius = c.allowed_radius(z);
            for ir in 0..=5 {
                let r = radius * ir as f64 / 5.0;
                for ia in 0..8 {
                    let angle = ia as f64 * std::f64::consts::FRAC_PI_4;
                    let n = node(r * angle.cos(), r * angle.sin(), z);
                    let (region, normal) = c.classify(&n).unwrap();
                    match region {
                        Region::Domain => assert!(normal.is_none()),
                        _ => {
                            let v = normal.unwrap();
                            let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
                            assert!((len - 1.0).abs() < 1e-9);
                            let outward = match region {
                                Region::End if z < 500.0 => [0.0, 0.0, -1.0],
                                Region::End => [0.0, 0.0, 1.0],
                                Region::Side => [n.x / r, n.y / r, 0.0],
                                _ => [0.0, 0.0, if z < 500.0 { -1.0 } else { 1.0 }],
                            };
                            let dot = v[0] * outward[0] + v[1] * outward[1] + v[2] * outward[2];
                            assert!(dot > 0.0, "normal {v:?} at ({}, {}, {z}) is not outward", n.x, n.y);
                        }
                    }
                }
            }
        }
    }
}
