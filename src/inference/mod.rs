//! Inference algorithms built on the batch handler.

mod rejection;

pub use rejection::{
    quantile, Rejection, RejectionConfig, RejectionResult, Sample, SampleAccumulator, SamplerState, StoppingRule,
};
