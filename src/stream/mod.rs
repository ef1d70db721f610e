pub mod candles;
pub mod codec;
pub mod scaler;
pub mod streamer;
