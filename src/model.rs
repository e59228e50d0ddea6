//! Model components for Tacotron.
//!
//! ## Components
//!
//! - [`layers`]: batch norm, conv blocks, zoneout LSTM, prenet, projections
//! - [`mask`]: length masks for padded batches
//! - [`encoder`]: conv stack + bidirectional LSTM
//! - [`attention`]: location-sensitive attention
//! - [`helpers`]: teacher-forcing and synthesis decoder helpers
//! - [`decoder`]: decoder cell and the dynamic decode loop
//! - [`postnet`]: convolutional residual refiner
//! - [`tacotron`]: the full graph

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod helpers;
pub mod layers;
pub mod mask;
pub mod postnet;
pub mod tacotron;

pub use tacotron::{ModelInputs, RunMode, Tacotron, TacotronOutput, Targets, pad_inputs};
