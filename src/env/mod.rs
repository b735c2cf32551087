pub mod discover;
pub mod freeze;
pub mod imports;
pub mod index;
pub mod pip;
