pub mod cluster;
pub mod extension;
pub mod installplan;
