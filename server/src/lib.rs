//! Storage core of the virtual-tour CMS: scene, tour and graph documents
//! kept as JSON files across several deployment locations, plus visit
//! analytics shared between worker processes.

pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod fsio;
pub mod graph;
pub mod mirror;
pub mod paths;
pub mod scenes;
pub mod stats;
pub mod tours;
pub mod urlnorm;
