pub mod config;
pub mod embedding;
pub mod encoder;
pub mod heads;
pub mod lstm;

pub use config::EncoderConfig;
pub use embedding::TokenEmbedding;
pub use encoder::{Encoding, SeqEncoder};
pub use heads::SequenceLoss;
pub use lstm::{LstmLayer, LstmState};
