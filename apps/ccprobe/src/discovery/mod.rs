//! Finding a running card agent: candidate generation, liveness probing and
//! the first-success-wins race across local ports and cloud instances.

pub mod candidates;
pub mod probe;

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::ConfigError;

pub use candidates::{EndpointCandidate, generate, sample_instances};
pub use probe::{HttpProber, ProbeHit, ProbeOutcome, Prober};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no agent answered a liveness probe within {waited:?}")]
    NoLiveEndpoint { waited: Duration },
}

/// The winner of a discovery race, held for the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Protocol advertised by the agent itself, falling back to the scheme
    /// of the URL that answered.
    pub protocol: String,
    /// Address the agent answered on, used verbatim for later requests.
    pub base_url: Url,
    pub port: u16,
    /// Session identifier minted by the agent. Some builds only send it on
    /// the first liveness response.
    pub session_id: Option<String>,
}

impl DiscoveredEndpoint {
    pub fn from_hit(hit: &ProbeHit) -> Self {
        let protocol = hit
            .proto()
            .map(str::to_string)
            .unwrap_or_else(|| hit.url.scheme().to_string());
        Self {
            protocol,
            port: hit.url.port_or_known_default().unwrap_or(0),
            base_url: hit.url.clone(),
            session_id: hit.session_uuid().map(str::to_string),
        }
    }

    /// Folds a newer discovery result into this one. Address fields always
    /// follow the newer result; a known session id survives unless the newer
    /// result carries its own.
    pub fn absorb(&mut self, newer: DiscoveredEndpoint) {
        let DiscoveredEndpoint {
            protocol,
            base_url,
            port,
            session_id,
        } = newer;
        self.protocol = protocol;
        self.base_url = base_url;
        self.port = port;
        if session_id.is_some() {
            self.session_id = session_id;
        }
    }

    /// Same keep-unless-replaced rule as [`absorb`], for liveness re-checks
    /// that only refresh the session id.
    ///
    /// [`absorb`]: DiscoveredEndpoint::absorb
    pub fn refresh_session(&mut self, session_id: Option<String>) {
        if session_id.is_some() {
            self.session_id = session_id;
        }
    }

    /// Wire-shaped view of the endpoint for the response log.
    pub fn summary(&self) -> Value {
        json!({
            "proto": self.protocol,
            "baseUrl": self.base_url.as_str(),
            "port": self.port,
            "uuid": self.session_id,
        })
    }
}

/// Races every candidate concurrently and returns the first success.
///
/// Failed and timed-out probes are logged and dropped from the race; they can
/// never win it. When no probe succeeds the race keeps waiting out the
/// remaining candidates until `overall_timeout` has fully elapsed, so a burst
/// of instant connection refusals reports at the deadline rather than
/// immediately. Probes still in flight when a winner emerges are dropped
/// without waiting for them.
pub async fn discover(
    prober: &dyn Prober,
    candidates: &[EndpointCandidate],
    attempt_timeout: Duration,
    overall_timeout: Duration,
) -> Result<DiscoveredEndpoint, DiscoveryError> {
    let mut probes: FuturesUnordered<_> = candidates
        .iter()
        .map(|candidate| async move { (candidate, prober.probe(candidate, attempt_timeout).await) })
        .collect();

    let race = async {
        while let Some((candidate, outcome)) = probes.next().await {
            match outcome {
                ProbeOutcome::Success(hit) => {
                    info!(url = %hit.url, "agent answered liveness probe");
                    return DiscoveredEndpoint::from_hit(&hit);
                }
                ProbeOutcome::Failure { reason } => {
                    debug!(url = %candidate.url, %reason, "candidate dropped from race");
                }
                ProbeOutcome::TimedOut => {
                    debug!(url = %candidate.url, "candidate probe timed out");
                }
            }
        }
        debug!("all candidates settled without a success");
        std::future::pending::<DiscoveredEndpoint>().await
    };

    match tokio::time::timeout(overall_timeout, race).await {
        Ok(endpoint) => Ok(endpoint),
        Err(_) => Err(DiscoveryError::NoLiveEndpoint {
            waited: overall_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::{Instant, sleep};

    enum Script {
        Succeed { after: Duration, body: Value },
        Fail { after: Duration },
    }

    /// Prober that follows a per-host-and-port script; unscripted candidates
    /// behave like an unreachable host and run into the attempt timeout.
    struct ScriptedProber {
        scripts: HashMap<(String, u16), Script>,
        settled: Mutex<Vec<u16>>,
    }

    impl ScriptedProber {
        fn new(scripts: Vec<((&str, u16), Script)>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|((host, port), script)| ((host.to_string(), port), script))
                    .collect(),
                settled: Mutex::new(Vec::new()),
            }
        }

        fn settled_ports(&self) -> Vec<u16> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(
            &self,
            candidate: &EndpointCandidate,
            attempt_timeout: Duration,
        ) -> ProbeOutcome {
            let host = candidate.url.host_str().unwrap_or_default().to_string();
            let port = candidate.url.port_or_known_default().unwrap_or(0);
            let outcome = match self.scripts.get(&(host, port)) {
                Some(Script::Succeed { after, body }) => {
                    sleep(*after).await;
                    ProbeOutcome::Success(ProbeHit {
                        url: candidate.url.clone(),
                        body: body.clone(),
                    })
                }
                Some(Script::Fail { after }) => {
                    sleep(*after).await;
                    ProbeOutcome::Failure {
                        reason: "connection refused".to_string(),
                    }
                }
                None => {
                    sleep(attempt_timeout).await;
                    ProbeOutcome::TimedOut
                }
            };
            self.settled.lock().unwrap().push(port);
            outcome
        }
    }

    fn local(port: u16) -> EndpointCandidate {
        EndpointCandidate::new(Url::parse(&format!("http://127.0.0.1:{port}")).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_while_others_hang() {
        let config = DiscoveryConfig::default();
        let mut rng = StdRng::seed_from_u64(5);
        let candidates = generate(&config, &mut rng).unwrap();
        let prober = ScriptedProber::new(vec![(
            ("127.0.0.1", 43456),
            Script::Succeed {
                after: Duration::from_millis(200),
                body: json!({"uuid": "f0e1"}),
            },
        )]);

        let start = Instant::now();
        let endpoint = discover(
            &prober,
            &candidates,
            config.attempt_timeout,
            config.overall_timeout,
        )
        .await
        .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(endpoint.port, 43456);
        assert_eq!(
            endpoint.base_url,
            Url::parse("http://127.0.0.1:43456").unwrap()
        );
        assert_eq!(endpoint.protocol, "http");
        assert_eq!(endpoint.session_id.as_deref(), Some("f0e1"));
    }

    #[tokio::test(start_paused = true)]
    async fn advertised_proto_overrides_url_scheme() {
        let candidates = vec![local(35153)];
        let prober = ScriptedProber::new(vec![(
            ("127.0.0.1", 35153),
            Script::Succeed {
                after: Duration::from_millis(10),
                body: json!({"uuid": "u1", "proto": "wss"}),
            },
        )]);

        let endpoint = discover(
            &prober,
            &candidates,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(endpoint.protocol, "wss");
    }

    #[tokio::test(start_paused = true)]
    async fn all_timeouts_fail_at_the_overall_deadline() {
        let config = DiscoveryConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        let candidates = generate(&config, &mut rng).unwrap();
        let prober = ScriptedProber::new(vec![]);

        let start = Instant::now();
        let result = discover(
            &prober,
            &candidates,
            config.attempt_timeout,
            config.overall_timeout,
        )
        .await;

        assert_eq!(start.elapsed(), Duration::from_millis(5000));
        assert!(matches!(
            result,
            Err(DiscoveryError::NoLiveEndpoint { waited }) if waited == Duration::from_millis(5000)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn instant_failures_still_wait_out_the_deadline() {
        let candidates = vec![local(1001), local(1002), local(1003)];
        let prober = ScriptedProber::new(vec![
            (
                ("127.0.0.1", 1001),
                Script::Fail {
                    after: Duration::from_millis(1),
                },
            ),
            (
                ("127.0.0.1", 1002),
                Script::Fail {
                    after: Duration::from_millis(1),
                },
            ),
            (
                ("127.0.0.1", 1003),
                Script::Fail {
                    after: Duration::from_millis(2),
                },
            ),
        ]);

        let start = Instant::now();
        let result = discover(
            &prober,
            &candidates,
            Duration::from_millis(5000),
            Duration::from_millis(5000),
        )
        .await;

        assert_eq!(start.elapsed(), Duration::from_millis(5000));
        assert!(matches!(
            result,
            Err(DiscoveryError::NoLiveEndpoint { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slower_success_is_dropped_once_a_winner_emerges() {
        let candidates = vec![local(2001), local(2002)];
        let prober = ScriptedProber::new(vec![
            (
                ("127.0.0.1", 2001),
                Script::Succeed {
                    after: Duration::from_millis(100),
                    body: json!({"uuid": "fast"}),
                },
            ),
            (
                ("127.0.0.1", 2002),
                Script::Succeed {
                    after: Duration::from_millis(400),
                    body: json!({"uuid": "slow"}),
                },
            ),
        ]);

        let endpoint = discover(
            &prober,
            &candidates,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(endpoint.session_id.as_deref(), Some("fast"));

        // Give the slower probe more than enough virtual time; it was dropped
        // with the race and must never settle.
        sleep(Duration::from_secs(1)).await;
        assert_eq!(prober.settled_ports(), vec![2001]);
    }

    #[test]
    fn absorb_keeps_session_id_when_newer_result_lacks_one() {
        let mut endpoint = DiscoveredEndpoint {
            protocol: "http".into(),
            base_url: Url::parse("http://127.0.0.1:35153").unwrap(),
            port: 35153,
            session_id: Some("keep-me".into()),
        };
        endpoint.absorb(DiscoveredEndpoint {
            protocol: "https".into(),
            base_url: Url::parse("https://m4.mordomo.gov.pt:43456").unwrap(),
            port: 43456,
            session_id: None,
        });

        assert_eq!(endpoint.protocol, "https");
        assert_eq!(endpoint.port, 43456);
        assert_eq!(endpoint.session_id.as_deref(), Some("keep-me"));
    }

    #[test]
    fn absorb_prefers_a_fresh_session_id() {
        let mut endpoint = DiscoveredEndpoint {
            protocol: "http".into(),
            base_url: Url::parse("http://127.0.0.1:35153").unwrap(),
            port: 35153,
            session_id: Some("stale".into()),
        };
        endpoint.absorb(DiscoveredEndpoint {
            protocol: "http".into(),
            base_url: Url::parse("http://127.0.0.1:35153").unwrap(),
            port: 35153,
            session_id: Some("fresh".into()),
        });
        assert_eq!(endpoint.session_id.as_deref(), Some("fresh"));
    }

    #[test]
    fn summary_uses_wire_field_names() {
        let endpoint = DiscoveredEndpoint {
            protocol: "http".into(),
            base_url: Url::parse("http://127.0.0.1:43456").unwrap(),
            port: 43456,
            session_id: None,
        };
        let summary = endpoint.summary();
        assert_eq!(summary["proto"], "http");
        assert_eq!(summary["baseUrl"], "http://127.0.0.1:43456/");
        assert_eq!(summary["port"], 43456);
        assert!(summary["uuid"].is_null());
    }
}
