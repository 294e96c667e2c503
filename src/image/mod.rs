mod buffer;
pub use buffer::ImageBuffer;

mod window;
pub use window::Window;
