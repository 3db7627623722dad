//! Binary encodings for storage keys.

pub mod keycode;
