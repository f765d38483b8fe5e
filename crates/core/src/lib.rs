//! Small set of utilities shared by every crate in the workspace: a cheap-clone
//! interned string type, a borrow-or-owned helper, and a Tokio runtime metrics collector.

pub mod bow;
pub mod strng;
pub mod tokio_metrics;

pub use strng::Strng;

pub mod prelude {
	pub use crate::Strng;
	pub use crate::bow::OwnedOrBorrowed;
}
