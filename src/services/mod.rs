pub mod audio;
pub mod expression;
pub mod playback;
pub mod presenter;
pub mod render;
pub mod store;
pub mod tags;
