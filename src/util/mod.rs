//! Internal utilities: key mixing, coordinate packing, and the striped
//! counter used for map size accounting.

pub mod counter;
pub mod hash;

pub use counter::StripedAdder;
