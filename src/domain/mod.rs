pub mod constants;
pub mod patch;
pub mod pdb;
pub mod pe;
