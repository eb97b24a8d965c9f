//! # 段付き軸の非定常温度場を推定する物理情報ニューラルネットワーク (PINN) ライブラリ
//!
//! `burn` フレームワークを使用して、3段の段付き軸の温度 T(x, y, z, t) を
//! 少数のセンサ観測と熱伝導方程式・境界条件から学習するための主要なコンポーネントを提供します。
//!
//! 処理の流れ:
//! 1. [`data`] で節点温度テーブルを読み込み、[`geometry`] で各節点を領域に分類します。
//! 2. [`points`] で損失項ごとの時空間点集合を作ります。
//! 3. [`model`] の MLP を、[`pinn`] の残差と [`loss`] の多項損失で学習します（[`training`]）。
//! 4. [`checkpoint`] でパラメータを保存し、[`evaluation`] で全場テーブルと比較します。

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod geometry;
pub mod inference;
pub mod loss;
pub mod model;
pub mod pinn;
pub mod points;
pub mod report;
pub mod training;
