pub mod assets;
pub mod hash;
pub mod path;
