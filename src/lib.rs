pub mod batch;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod fetch;
pub mod filter;
pub mod merge;
pub mod output;
pub mod parser;
pub mod sink;
pub mod sort;
pub mod source;
pub mod stats;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
