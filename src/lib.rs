pub mod config;
pub mod dispatch;
pub mod fetch;
pub mod index;
pub mod matcher;
pub mod names;
pub mod output;
pub mod parser;
pub mod poll;
pub mod publish;
pub mod stats;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
