use std::time::Duration;

/// Tuning knobs for [`crate::ReqwestHydrator`].
#[derive(Debug, Clone)]
pub struct HydratorConfig {
    /// Base URL of the mirrored origin; object keys are joined onto it.
    pub origin: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// How long an idle pooled connection is kept before being closed.
    pub idle_timeout: Duration,
    /// Skip TLS certificate verification against the origin.
    ///
    /// The historical deployment this crate is modeled on always skipped
    /// verification. That is not a safe default for a crate that may talk
    /// to arbitrary origins, so this defaults to `false`; set it explicitly
    /// when mirroring an origin with a certificate that can't be validated.
    pub tls_insecure: bool,
}

impl Default for HydratorConfig {
    fn default() -> Self {
        Self {
            origin: String::new(),
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            tls_insecure: false,
        }
    }
}

impl HydratorConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into(), ..Default::default() }
    }
}
