pub mod errors;
pub mod events;
pub mod todo;
pub mod user;

pub use errors::*;
pub use events::*;
pub use todo::*;
pub use user::*;
