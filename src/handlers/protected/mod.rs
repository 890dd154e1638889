pub mod todos;

pub use todos::{add_todo, list_todos};
