use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started: None,
        }
    }
}

/// Per-provider breaker shared by concurrent runs.
///
/// After `failure_threshold` consecutive failures a provider is skipped until
/// `cooldown` has passed. The first caller after that gets the single
/// half-open probe; everyone else is still refused until the probe reports
/// back, or until it has been outstanding for another `cooldown`.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn allows(&self, provider_id: &str) -> bool {
        self.with_circuit(provider_id, |circuit, cooldown| {
            let since = |at: Option<Instant>| at.map(|at| at.elapsed()).unwrap_or(Duration::MAX);
            let waited = match circuit.state {
                CircuitState::Closed => return true,
                CircuitState::Open => since(circuit.opened_at),
                CircuitState::HalfOpen => since(circuit.probe_started),
            };
            if waited < cooldown {
                return false;
            }
            circuit.state = CircuitState::HalfOpen;
            circuit.probe_started = Some(Instant::now());
            true
        })
    }

    pub fn record_success(&self, provider_id: &str) {
        self.with_circuit(provider_id, |circuit, _| {
            *circuit = Circuit::default();
        });
    }

    pub fn record_failure(&self, provider_id: &str) {
        let threshold = self.failure_threshold;
        let tripped = self.with_circuit(provider_id, |circuit, _| {
            circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            let trip = circuit.state == CircuitState::HalfOpen
                || circuit.consecutive_failures >= threshold;
            if trip {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.probe_started = None;
            }
            trip
        });
        if tripped {
            tracing::warn!(provider = provider_id, "circuit opened");
        }
    }

    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.with_circuit(provider_id, |circuit, _| circuit.state)
    }

    fn with_circuit<T>(&self, provider_id: &str, f: impl FnOnce(&mut Circuit, Duration) -> T) -> T {
        let mut circuits = match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let circuit = circuits.entry(provider_id.to_string()).or_default();
        f(circuit, self.cooldown)
    }
}
