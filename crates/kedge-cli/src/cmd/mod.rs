pub mod requirements;
pub mod test;
