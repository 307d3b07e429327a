pub mod config_cmd;
pub mod control;
pub mod run;
