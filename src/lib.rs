//! Background pipeline that mirrors AIRR Data Commons repository data into a
//! local cache tree and publishes each cached file through a durable public link.

pub mod adc;
pub mod alert;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod load_status;
pub mod output;
pub mod pipeline;
pub mod postit;
pub mod queue;
pub mod records;
pub mod settings;
pub mod store;
