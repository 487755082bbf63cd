use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Base requeue interval after a fully reconciled pass, in seconds
    pub reconcile_ttl: u64,
    /// Upper bound for a single remote exec into a pod, in seconds
    pub exec_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_ttl: from_env_default("RECONCILE_TTL_SECONDS", "90")
                .parse()
                .unwrap_or(90),
            exec_timeout: from_env_default("EXEC_TIMEOUT_SECONDS", "30")
                .parse()
                .unwrap_or(30),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}
