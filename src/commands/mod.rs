pub mod query;
pub mod rebuild;
pub mod run;
pub mod send;
pub mod status;
