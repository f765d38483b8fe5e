//! `Strng` is a cheap-to-clone immutable string used throughout the proxy for
//! identifiers that get copied into many request contexts (provider names, key
//! hashes, model families). It is a thin alias over `arcstr::ArcStr` so cloning
//! is a refcount bump rather than an allocation.

pub type Strng = arcstr::ArcStr;

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::from(s.as_ref())
}

/// Build a `Strng` from a literal known at compile time, for free.
#[macro_export]
macro_rules! literal {
	($s:expr) => {
		$crate::strng::Strng::from($s)
	};
}

/// Build a `Strng` via `format!`, for the (common) case where the result isn't
/// known until runtime.
#[macro_export]
macro_rules! format {
	($($arg:tt)*) => {
		$crate::strng::Strng::from(::std::format!($($arg)*))
	};
}
