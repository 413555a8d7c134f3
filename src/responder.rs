use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info};

pub const RESP_OK: &str = "BB 200 OK";
pub const RESP_BAD_REQUEST: &str = "BB 400 BADREQUEST";
pub const RESP_TIMEOUT: &str = "BB 408 TIMEOUT";

#[derive(Debug, Default)]
struct SignalState {
    peer_address: Option<String>,
    ready_for_chaos_start: bool,
    chaos_start: Option<Instant>,
    ready_for_chaos_stop: bool,
    chaos_stopped: bool,
    test_result: Option<String>,
    test_result_received: bool,
}

/// Serves the remote peer's line protocol from shared signal state.
///
/// The driver side mutates the readiness signals; the peer's verbs read
/// them (blocking up to `wait_timeout`) or set the peer-owned signals.
/// One mutex guards the whole state; waiters are woken through a single
/// [`Notify`].
#[derive(Debug)]
pub struct ProtocolResponder {
    state: Mutex<SignalState>,
    changed: Notify,
    wait_timeout: Duration,
}

impl ProtocolResponder {
    #[must_use]
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            changed: Notify::new(),
            wait_timeout,
        }
    }

    /// Handles one request line, returning the one response line.
    pub async fn handle(&self, request_line: &str) -> String {
        let mut atoms = request_line.split_ascii_whitespace();
        let verb = atoms.next().unwrap_or_default();

        match verb {
            "HELLO" => RESP_OK.to_owned(),
            "MADDR" => self.handle_announce_address(atoms.next()).await,
            "WLOAD" => {
                if self.wait_for(|state| state.ready_for_chaos_start).await {
                    info!("baseline load ready, telling peer to start chaos");
                    RESP_OK.to_owned()
                } else {
                    RESP_TIMEOUT.to_owned()
                }
            }
            "CHSTR" => {
                self.set_chaos_start_time();
                info!("peer has started chaos");
                RESP_OK.to_owned()
            }
            "WCSTR" => {
                if self.wait_for(|state| state.ready_for_chaos_stop).await {
                    info!("telling peer to stop chaos");
                    RESP_OK.to_owned()
                } else {
                    RESP_TIMEOUT.to_owned()
                }
            }
            "CHSTP" => {
                self.set_chaos_stopped();
                info!("peer has stopped chaos");
                RESP_OK.to_owned()
            }
            "WTRES" => {
                let result = {
                    let deadline = time::Instant::now() + self.wait_timeout;
                    self.wait_for_value(deadline, |state| state.test_result.clone())
                        .await
                };
                match result {
                    Some(result) => {
                        info!("transmitting test results to peer");
                        format!("{RESP_OK}: {result}")
                    }
                    None => RESP_TIMEOUT.to_owned(),
                }
            }
            "ACKTR" => {
                self.set_test_result_received();
                info!("peer acknowledged test results");
                RESP_OK.to_owned()
            }
            _ => {
                debug!(verb, "unrecognized protocol verb");
                RESP_BAD_REQUEST.to_owned()
            }
        }
    }

    async fn handle_announce_address(&self, address: Option<&str>) -> String {
        let Some(address) = address else {
            return RESP_BAD_REQUEST.to_owned();
        };
        if !is_valid_ipv4(address) {
            return RESP_BAD_REQUEST.to_owned();
        }

        let newly_set = {
            let mut state = self.state.lock();
            if state.peer_address.is_some() {
                false
            } else {
                state.peer_address = Some(address.trim().to_owned());
                true
            }
        };

        if newly_set {
            info!(address, "peer announced its address");
            self.changed.notify_waiters();
            RESP_OK.to_owned()
        } else {
            // Re-announcement while set: pause briefly, then refuse.
            time::sleep(self.wait_timeout).await;
            RESP_TIMEOUT.to_owned()
        }
    }

    /// Blocks until the peer has announced its address. Unlike the verb
    /// waits this has no deadline; the driver cannot proceed without it.
    pub async fn await_peer_address(&self) -> String {
        loop {
            let notified = self.changed.notified();
            if let Some(address) = self.state.lock().peer_address.clone() {
                return address;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn peer_address(&self) -> Option<String> {
        self.state.lock().peer_address.clone()
    }

    async fn wait_for(&self, predicate: impl Fn(&SignalState) -> bool) -> bool {
        let deadline = time::Instant::now() + self.wait_timeout;
        self.wait_for_value(deadline, |state| predicate(state).then_some(()))
            .await
            .is_some()
    }

    async fn wait_for_value<T>(
        &self,
        deadline: time::Instant,
        extract: impl Fn(&SignalState) -> Option<T>,
    ) -> Option<T> {
        loop {
            let notified = self.changed.notified();
            if let Some(value) = extract(&self.state.lock()) {
                return Some(value);
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                // One last check in case the signal landed on the deadline.
                return extract(&self.state.lock());
            }
        }
    }

    /*
     * Driver-side signal mutation.
     */

    pub fn set_ready_for_chaos_start(&self) {
        self.state.lock().ready_for_chaos_start = true;
        self.changed.notify_waiters();
    }

    pub fn clear_ready_for_chaos_start(&self) {
        self.state.lock().ready_for_chaos_start = false;
    }

    pub fn set_chaos_start_time(&self) {
        self.state.lock().chaos_start = Some(Instant::now());
        self.changed.notify_waiters();
    }

    #[must_use]
    pub fn chaos_start_time(&self) -> Option<Instant> {
        self.state.lock().chaos_start
    }

    pub fn set_ready_for_chaos_stop(&self) {
        self.state.lock().ready_for_chaos_stop = true;
        self.changed.notify_waiters();
    }

    pub fn clear_ready_for_chaos_stop(&self) {
        self.state.lock().ready_for_chaos_stop = false;
    }

    pub fn set_chaos_stopped(&self) {
        self.state.lock().chaos_stopped = true;
        self.changed.notify_waiters();
    }

    #[must_use]
    pub fn is_chaos_stopped(&self) -> bool {
        self.state.lock().chaos_stopped
    }

    pub fn set_test_result(&self, result: String) {
        self.state.lock().test_result = Some(result);
        self.changed.notify_waiters();
    }

    pub fn set_test_result_received(&self) {
        self.state.lock().test_result_received = true;
        self.changed.notify_waiters();
    }

    #[must_use]
    pub fn is_test_result_received(&self) -> bool {
        self.state.lock().test_result_received
    }

    /// Resets all per-run signals. The peer address survives; it is
    /// announced once per peer, not once per run.
    pub fn reset_test(&self) {
        let mut state = self.state.lock();
        state.ready_for_chaos_start = false;
        state.chaos_start = None;
        state.ready_for_chaos_stop = false;
        state.chaos_stopped = false;
        state.test_result = None;
        state.test_result_received = false;
    }
}

/// Strict dotted-quad IPv4: trimmed length 6–15, four octets 0–255.
#[must_use]
pub fn is_valid_ipv4(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    if trimmed.len() < 6 || trimmed.len() > 15 {
        return false;
    }

    let mut octets = 0;
    for part in trimmed.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|byte| byte.is_ascii_digit()) {
            return false;
        }
        let Ok(value) = part.parse::<u16>() else {
            return false;
        };
        if value > 255 {
            return false;
        }
        octets += 1;
    }
    octets == 4
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ProtocolResponder, RESP_BAD_REQUEST, RESP_OK, RESP_TIMEOUT, is_valid_ipv4};

    fn responder() -> ProtocolResponder {
        ProtocolResponder::new(Duration::from_millis(50))
    }

    #[test]
    fn ipv4_validation_accepts_strict_dotted_quads_only() {
        assert!(is_valid_ipv4("10.0.0.5"));
        assert!(is_valid_ipv4(" 192.168.1.250 "));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(is_valid_ipv4("0.0.0.0"));

        assert!(!is_valid_ipv4("not-an-ip"));
        assert!(!is_valid_ipv4("1.2.3"));
        assert!(!is_valid_ipv4("1.2.3.4.5"));
        assert!(!is_valid_ipv4("256.1.1.1"));
        assert!(!is_valid_ipv4("1.2.3.4444"));
        assert!(!is_valid_ipv4("1.2.3."));
        assert!(!is_valid_ipv4(""));
    }

    #[tokio::test]
    async fn hello_and_unknown_verbs() {
        let responder = responder();
        assert_eq!(responder.handle("HELLO").await, RESP_OK);
        assert_eq!(responder.handle("NONSENSE").await, RESP_BAD_REQUEST);
        assert_eq!(responder.handle("").await, RESP_BAD_REQUEST);
    }

    #[tokio::test]
    async fn address_announcement_is_write_once() {
        let responder = responder();

        assert_eq!(responder.handle("MADDR 10.0.0.5").await, RESP_OK);
        assert_eq!(responder.peer_address().as_deref(), Some("10.0.0.5"));

        // Second announcement pauses and times out.
        assert_eq!(responder.handle("MADDR 10.0.0.6").await, RESP_TIMEOUT);
        assert_eq!(responder.peer_address().as_deref(), Some("10.0.0.5"));

        assert_eq!(responder.handle("MADDR not-an-ip").await, RESP_BAD_REQUEST);
        assert_eq!(responder.handle("MADDR").await, RESP_BAD_REQUEST);
    }

    #[tokio::test]
    async fn blocking_verbs_time_out_without_signal() {
        let responder = responder();
        assert_eq!(responder.handle("WLOAD").await, RESP_TIMEOUT);
        assert_eq!(responder.handle("WCSTR").await, RESP_TIMEOUT);
        assert_eq!(responder.handle("WTRES").await, RESP_TIMEOUT);
    }

    #[tokio::test]
    async fn blocking_verbs_return_ok_once_signaled() {
        let responder = responder();

        responder.set_ready_for_chaos_start();
        assert_eq!(responder.handle("WLOAD").await, RESP_OK);

        responder.set_ready_for_chaos_stop();
        assert_eq!(responder.handle("WCSTR").await, RESP_OK);
    }

    #[tokio::test]
    async fn wload_wakes_mid_wait_when_signal_arrives() {
        let responder = Arc::new(ProtocolResponder::new(Duration::from_millis(500)));

        let waiter = {
            let responder = responder.clone();
            tokio::spawn(async move { responder.handle("WLOAD").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        responder.set_ready_for_chaos_start();

        let response = waiter.await;
        assert!(matches!(response, Ok(line) if line == RESP_OK));
    }

    #[tokio::test]
    async fn test_results_round_trip_through_wtres_and_acktr() {
        let responder = responder();

        assert_eq!(responder.handle("WTRES").await, RESP_TIMEOUT);

        responder.set_test_result("1,2,3,csv".to_owned());
        assert_eq!(responder.handle("WTRES").await, "BB 200 OK: 1,2,3,csv");

        assert!(!responder.is_test_result_received());
        assert_eq!(responder.handle("ACKTR").await, RESP_OK);
        assert!(responder.is_test_result_received());
    }

    #[tokio::test]
    async fn chaos_signals_set_timestamp_and_stop_flag() {
        let responder = responder();
        assert!(responder.chaos_start_time().is_none());

        assert_eq!(responder.handle("CHSTR").await, RESP_OK);
        assert!(responder.chaos_start_time().is_some());

        assert!(!responder.is_chaos_stopped());
        assert_eq!(responder.handle("CHSTP").await, RESP_OK);
        assert!(responder.is_chaos_stopped());
    }

    #[tokio::test]
    async fn reset_preserves_peer_address_and_clears_run_signals() {
        let responder = responder();
        assert_eq!(responder.handle("MADDR 10.0.0.5").await, RESP_OK);
        responder.set_ready_for_chaos_start();
        responder.set_chaos_start_time();
        responder.set_chaos_stopped();
        responder.set_test_result("r".to_owned());
        responder.set_test_result_received();

        responder.reset_test();

        assert_eq!(responder.peer_address().as_deref(), Some("10.0.0.5"));
        assert!(responder.chaos_start_time().is_none());
        assert!(!responder.is_chaos_stopped());
        assert!(!responder.is_test_result_received());
        assert_eq!(responder.handle("WTRES").await, RESP_TIMEOUT);
    }

    #[tokio::test]
    async fn await_peer_address_blocks_until_announced() {
        let responder = Arc::new(responder());
        let waiter = {
            let responder = responder.clone();
            tokio::spawn(async move { responder.await_peer_address().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(responder.handle("MADDR 172.16.0.9").await, RESP_OK);
        let address = waiter.await;
        assert!(matches!(address, Ok(addr) if addr == "172.16.0.9"));
    }
}
