//! Still images and video clips in, animated GIF or MP4 out.
//!
//! [`pipeline::Pipeline`] turns one request into an encoded [`models::Artifact`];
//! [`processor::Scheduler`] runs pipelines on a bounded pool of worker threads
//! and records their progress in a [`registry::JobRegistry`].

#![forbid(unsafe_code)]

pub mod command;
pub mod config;
pub mod ease;
pub mod encode;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod postprocess;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod synth;
pub mod web;

pub use config::Config;
pub use error::{ConvertError, ConvertResult, ErrorKind};
pub use models::{Artifact, Format, Inputs, JobId, JobStatus, Mode, Pan, Params, State, Trim};
pub use pipeline::Pipeline;
pub use processor::Scheduler;
pub use registry::{JobHandle, JobRegistry};
