pub mod cmd;
pub mod exit;
pub mod output;
pub mod root;
