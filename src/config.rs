//! Runtime-configurable tuning parameters for rankmesh.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `RANKMESH_`) or by constructing a custom `MeshConfig`.

/// Tuning parameters consumed by the point-to-point engine.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Progress-poll iteration ceiling per `test`/`testall` call.
    ///
    /// Exhausting the ceiling is not a failure; the caller re-invokes.
    pub poll_iters: u32,

    /// Resolve endpoints through the out-of-band directory instead of the
    /// transport's address-exchange interface.
    pub oob_endpoints: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            poll_iters: 64,
            oob_endpoints: false,
        }
    }
}

impl MeshConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RANKMESH_POLL_ITERS`
    /// - `RANKMESH_OOB_ENDPOINTS` (`1`/`true` enables)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RANKMESH_POLL_ITERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.poll_iters = n;
            }
        }
        if let Ok(v) = std::env::var("RANKMESH_OOB_ENDPOINTS") {
            cfg.oob_endpoints = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }
}
