pub mod backend;
pub mod config;
pub mod context;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod hybrid;
pub mod interpolate;
pub mod jobs;
pub mod keyframes;
pub mod models;
pub mod pipeline;
pub mod postprocess;
pub mod progress;
pub mod routes;
pub mod scene;
