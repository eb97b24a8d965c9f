//! 有限要素解析から抽出した節点温度テーブル（CSV）の読み込み。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PinnError, PinnResult};

/// CSVの1行。抽出スクリプトのネイティブな列名も別名として受け付けます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRow {
    #[serde(alias = "frame_index")]
    pub time_step_index: usize,
    #[serde(alias = "step_time")]
    pub time: f64,
    #[serde(alias = "node_set")]
    pub node_set_name: String,
    #[serde(alias = "instance")]
    pub instance_name: String,
    #[serde(alias = "node_label")]
    pub node_id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(alias = "NT11")]
    pub temperature: f64,
}

/// メッシュの節点。
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_id: u32,
    pub instance: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Node {
    pub fn radius(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// 1節点・1時刻の温度観測。`node` と `frame` はテーブル内のインデックスです。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub node: usize,
    pub frame: usize,
    pub temperature: f64,
}

/// 座標 (x, y, z, t) と温度の組。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledSample {
    pub coords: [f64; 4],
    pub temperature: f64,
}

/// 節点 × 時刻の温度テーブル。
#[derive(Debug, Clone, Default)]
pub struct TemperatureTable {
    nodes: Vec<Node>,
    times: Vec<f64>,
    observations: Vec<Observation>,
}

const COORD_TOLERANCE: f64 = 1e-6;

impl TemperatureTable {
    pub fn read_csv(path: impl AsRef<Path>) -> PinnResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| PinnError::Data(format!("cannot open '{}': {e}", path.display())))?;
        let table = Self::from_reader(file)
            .map_err(|e| PinnError::Data(format!("'{}': {e}", path.display())))?;
        tracing::info!(
            "'{}' を読み込みました: 節点 {} / 時刻 {} / 観測 {}",
            path.display(),
            table.nodes.len(),
            table.times.len(),
            table.observations.len()
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R) -> PinnResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let rows = csv_reader
            .deserialize::<TemperatureRow>()
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rows(&rows)
    }

    /// 行の一覧からテーブルを構築します。
    ///
    /// 同じ節点が複数の節点セットに現れる場合、(インスタンス, 節点, 時刻) が
    /// 重複する行は1つにまとめます。座標や温度が食い違う重複はデータエラーです。
    pub fn from_rows(rows: &[TemperatureRow]) -> PinnResult<Self> {
        if rows.is_empty() {
            return Err(PinnError::Data("temperature table has no rows".into()));
        }

        let mut frame_times: HashMap<usize, f64> = HashMap::new();
        for (line, row) in rows.iter().enumerate() {
            let values = [row.time, row.x, row.y, row.z, row.temperature];
            if values.iter().any(|v| !v.is_finite()) {
                return Err(PinnError::Data(format!(
                    "row {line} (node {}.{}) contains a non-finite value",
                    row.instance_name, row.node_id
                )));
            }
            match frame_times.entry(row.time_step_index) {
                Entry::Occupied(entry) => {
                    if (entry.get() - row.time).abs() > COORD_TOLERANCE * (1.0 + row.time.abs()) {
                        return Err(PinnError::Data(format!(
                            "time step {} maps to both {} and {}",
                            row.time_step_index,
                            entry.get(),
                            row.time
                        )));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(row.time);
                }
            }
        }

        let mut frames: Vec<(usize, f64)> = frame_times.into_iter().collect();
        frames.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let times: Vec<f64> = frames.iter().map(|(_, t)| *t).collect();
        let frame_of: HashMap<usize, usize> = frames
            .iter()
            .enumerate()
            .map(|(position, (index, _))| (*index, position))
            .collect();

        let mut nodes = Vec::new();
        let mut node_of: HashMap<(String, u32), usize> = HashMap::new();
        let mut observed: HashMap<(usize, usize), usize> = HashMap::new();
        let mut observations = Vec::new();

        for row in rows {
            let key = (row.instance_name.clone(), row.node_id);
            let node = match node_of.entry(key) {
                Entry::Occupied(entry) => {
                    let index = *entry.get();
                    let known: &Node = &nodes[index];
                    let same = [(known.x, row.x), (known.y, row.y), (known.z, row.z)]
                        .iter()
                        .all(|(a, b)| (a - b).abs() <= COORD_TOLERANCE * (1.0 + a.abs()));
                    if !same {
                        return Err(PinnError::Data(format!(
                            "node {}.{} has inconsistent coordinates",
                            row.instance_name, row.node_id
                        )));
                    }
                    index
                }
                Entry::Vacant(entry) => {
                    nodes.push(Node {
                        node_id: row.node_id,
                        instance: row.instance_name.clone(),
                        x: row.x,
                        y: row.y,
                        z: row.z,
                    });
                    *entry.insert(nodes.len() - 1)
                }
            };

            let frame = frame_of[&row.time_step_index];
            match observed.entry((node, frame)) {
                Entry::Occupied(entry) => {
                    let previous: &Observation = &observations[*entry.get()];
                    if (previous.temperature - row.temperature).abs() > COORD_TOLERANCE {
                        return Err(PinnError::Data(format!(
                            "node {}.{} has conflicting temperatures at time {}",
                            row.instance_name, row.node_id, row.time
                        )));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(observations.len());
                    observations.push(Observation {
                        node,
                        frame,
                        temperature: row.temperature,
                    });
                }
            }
        }

        Ok(Self {
            nodes,
            times,
            observations,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// 昇順に並んだ時刻。
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn time_range(&self) -> (f64, f64) {
        let start = self.times.first().copied().unwrap_or(0.0);
        let end = self.times.last().copied().unwrap_or(start);
        (start, end)
    }

    /// 最初の時刻における各節点の温度（観測がなければ `None`）。
    pub fn first_frame_temperatures(&self) -> Vec<Option<f64>> {
        let mut values = vec![None; self.nodes.len()];
        for observation in self.observations.iter().filter(|o| o.frame == 0) {
            values[observation.node] = Some(observation.temperature);
        }
        values
    }

    pub fn labeled_samples(&self) -> Vec<LabeledSample> {
        self.samples()
            .map(|(node, time, temperature)| LabeledSample {
                coords: [node.x, node.y, node.z, time],
                temperature,
            })
            .collect()
    }

    /// (節点, 時刻, 温度) の組を順に返します。
    pub fn samples(&self) -> impl Iterator<Item = (&Node, f64, f64)> + '_ {
        self.observations
            .iter()
            .map(|o| (&self.nodes[o.node], self.times[o.frame], o.temperature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE_HEADER_CSV: &str = "\
frame_index,step_time,node_set,instance,node_label,x,y,z,NT11
0,0.0,SENSORS-N,PART-1-1,7,0.0,0.0,500.0,20.0
0,0.0,ALL-N,PART-1-1,7,0.0,0.0,500.0,20.0
0,0.0,SENSORS-N,PART-1-1,8,35.0,0.0,500.0,20.0
1,10.0,SENSORS-N,PART-1-1,7,0.0,0.0,500.0,21.5
1,10.0,SENSORS-N,PART-1-1,8,35.0,0.0,500.0,20.5
";

    #[test]
    fn reads_extractor_header_names() {
        let table = TemperatureTable::from_reader(NATIVE_HEADER_CSV.as_bytes()).unwrap();
        assert_eq!(table.nodes().len(), 2);
        assert_eq!(table.times(), &[0.0, 10.0]);
        // 節点セット違いの重複行はまとめられる
        assert_eq!(table.observations().len(), 4);
        assert_eq!(table.time_range(), (0.0, 10.0));
        assert_eq!(table.nodes()[1].radius(), 35.0);
    }

    #[test]
    fn reads_documented_header_names() {
        let csv = "time_step_index,time,node_set_name,instance_name,node_id,x,y,z,temperature\n\
                   3,5.0,ALL,P,1,0,0,0,25.0\n";
        let table = TemperatureTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.nodes()[0].node_id, 1);
        assert_eq!(table.first_frame_temperatures(), vec![Some(25.0)]);
    }

    #[test]
    fn sorts_frames_by_time() {
        let rows = vec![row(2, 20.0, 1, 30.0), row(0, 0.0, 1, 10.0), row(1, 10.0, 1, 20.0)];
        let table = TemperatureTable::from_rows(&rows).unwrap();
        assert_eq!(table.times(), &[0.0, 10.0, 20.0]);
        let temps: Vec<f64> = table.samples().map(|(_, _, t)| t).collect();
        assert_eq!(temps, vec![30.0, 10.0, 20.0]);
        assert_eq!(table.first_frame_temperatures(), vec![Some(10.0)]);
    }

    #[test]
    fn rejects_empty_table() {
        assert!(matches!(
            TemperatureTable::from_rows(&[]),
            Err(PinnError::Data(_))
        ));
    }

    #[test]
    fn rejects_non_finite_temperature() {
        let rows = vec![row(0, 0.0, 1, f64::NAN)];
        assert!(matches!(
            TemperatureTable::from_rows(&rows),
            Err(PinnError::Data(_))
        ));
    }

    #[test]
    fn rejects_moving_node() {
        let mut moved = row(1, 1.0, 1, 20.0);
        moved.z += 1.0;
        let rows = vec![row(0, 0.0, 1, 20.0), moved];
        assert!(matches!(
            TemperatureTable::from_rows(&rows),
            Err(PinnError::Data(_))
        ));
    }

    #[test]
    fn rejects_malformed_csv() {
        let csv = "time_step_index,time,node_set_name\n0,0.0,ALL\n";
        assert!(matches!(
            TemperatureTable::from_reader(csv.as_bytes()),
            Err(PinnError::Data(_))
        ));
    }

    fn row(frame: usize, time: f64, node_id: u32, temperature: f64) -> TemperatureRow {
        TemperatureRow {
            time_step_index: frame,
            time,
            node_set_name: "ALL-N".into(),
            instance_name: "PART-1-1".into(),
            node_id,
            x: 0.0,
            y: 0.0,
            z: 100.0,
            temperature,
        }
    }
}
