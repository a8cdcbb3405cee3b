pub mod btree;
pub mod eliasfano;
pub mod hash;
