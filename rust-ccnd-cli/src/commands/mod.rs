pub mod interest;
pub mod publish;
