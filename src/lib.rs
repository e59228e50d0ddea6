//! Tacotron acoustic-feature prediction in pure Rust.
//!
//! A candle-based sequence-to-sequence model that maps symbol sequences to
//! vocoder frames (pitch, spectral envelope, aperiodicity), together with its
//! training loss and optimizer step.
//!
//! ## Architecture
//!
//! ```text
//! symbols → Embedding → Conv×N → BiLSTM ──► encoder outputs
//!                                              │
//!              ┌── location-sensitive attention┘
//!              ↓
//! <GO> → Prenet → LSTM×N → [frames·r, stop·r] ──► helper picks next input
//!                              ↓
//!                   Postnet residual → final frames
//! ```
//!
//! ## Modules
//!
//! - [`config`]: hyperparameters (JSON, defaults, validation)
//! - [`model`]: layers, encoder, attention, decoder helpers, postnet, [`model::Tacotron`]
//! - [`loss`]: masked / unmasked reconstruction, stop token, guided attention, L2
//! - [`optim`]: learning-rate schedule, global-norm clipping, Adam step

pub mod config;
pub mod loss;
pub mod model;
pub mod optim;

mod error;

pub use error::{Error, Result};
