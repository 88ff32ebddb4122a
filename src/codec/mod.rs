pub mod canonical;
pub mod ints;
pub mod record;
