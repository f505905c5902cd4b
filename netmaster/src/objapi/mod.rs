//! Object model served on the leader: user objects, the links between
//! them, and the controller that turns object changes into lifecycle calls.

pub mod controller;
pub mod links;
pub mod model;
pub mod undo;

pub use controller::ObjController;
pub use links::LinkTable;
pub use undo::UndoStack;
