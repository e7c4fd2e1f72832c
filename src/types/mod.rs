pub mod candle;
pub mod trading;

pub use candle::*;
pub use trading::*;
