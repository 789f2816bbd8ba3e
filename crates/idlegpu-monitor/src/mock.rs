//! Mock accelerator probe for testing

use crate::probe::{AcceleratorProbe, ProbeSample};
use crate::{ProbeError, Result};

use async_trait::async_trait;
use idlegpu_core::{AcceleratorBackend, BYTES_PER_MIB};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
enum Behavior {
    Sample(ProbeSample),
    Fail(String),
}

/// Probe whose readings are set by the test
pub struct MockProbe {
    behavior: Mutex<Behavior>,
    calls: Mutex<usize>,
}

impl MockProbe {
    /// Probe reporting the given utilization on an 8 GiB device
    pub fn with_utilization(utilization: f64) -> Self {
        Self {
            behavior: Mutex::new(Behavior::Sample(mock_sample(utilization))),
            calls: Mutex::new(0),
        }
    }

    /// Probe reporting an idle device
    pub fn idle() -> Self {
        Self::with_utilization(0.0)
    }

    /// Probe whose every sample fails
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            behavior: Mutex::new(Behavior::Fail(message.into())),
            calls: Mutex::new(0),
        }
    }

    /// Report this utilization from now on
    pub fn set_utilization(&self, utilization: f64) {
        *self.behavior.lock() = Behavior::Sample(mock_sample(utilization));
    }

    /// Report this exact sample from now on
    pub fn set_sample(&self, sample: ProbeSample) {
        *self.behavior.lock() = Behavior::Sample(sample);
    }

    /// Fail every sample from now on
    pub fn fail(&self, message: impl Into<String>) {
        *self.behavior.lock() = Behavior::Fail(message.into());
    }

    /// Number of samples taken so far
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl AcceleratorProbe for MockProbe {
    async fn sample(&self) -> Result<ProbeSample> {
        *self.calls.lock() += 1;
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Sample(sample) => {
                debug!("Mock probe sample: {:?}", sample);
                Ok(sample)
            }
            Behavior::Fail(message) => Err(ProbeError::Command(message)),
        }
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::Mock
    }
}

fn mock_sample(utilization: f64) -> ProbeSample {
    ProbeSample {
        utilization,
        memory_used: 2048 * BYTES_PER_MIB,
        memory_total: 8192 * BYTES_PER_MIB,
    }
}
