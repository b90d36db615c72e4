pub mod app;
pub mod list_store;
pub mod session;
pub mod subscriber;
pub mod view;

pub use app::*;
pub use list_store::*;
pub use session::*;
pub use subscriber::*;
pub use view::render;
