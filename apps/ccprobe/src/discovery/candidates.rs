use rand::Rng;
use url::Url;

use crate::config::{CANDIDATES_PER_TIER, ConfigError, DiscoveryConfig, INSTANCE_PLACEHOLDER};

/// One address the agent might answer on. Candidates carry no state beyond
/// the URL; everything else about an endpoint is learned from its liveness
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub url: Url,
}

impl EndpointCandidate {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    fn parse(raw: String) -> Result<Self, ConfigError> {
        let url = Url::parse(&raw).map_err(|source| ConfigError::InvalidCandidateUrl {
            url: raw,
            source,
        })?;
        Ok(Self { url })
    }
}

/// Draws `count` distinct instance numbers from `1..=max` by rejecting
/// repeats and sampling again. Order of first appearance is kept so the
/// pairing with ports stays stable for the rest of the race.
pub fn sample_instances(
    rng: &mut impl Rng,
    count: usize,
    max: u32,
) -> Result<Vec<u32>, ConfigError> {
    if (max as usize) < count {
        return Err(ConfigError::InstancePoolTooSmall { max, want: count });
    }
    let mut instances = Vec::with_capacity(count);
    while instances.len() < count {
        let pick = rng.gen_range(1..=max);
        if !instances.contains(&pick) {
            instances.push(pick);
        }
    }
    Ok(instances)
}

/// Builds the candidate set for one discovery attempt: the first
/// [`CANDIDATES_PER_TIER`] ports against the local base URL, then the same
/// ports against freshly sampled cloud instances. A new attempt samples new
/// instances.
pub fn generate(
    config: &DiscoveryConfig,
    rng: &mut impl Rng,
) -> Result<Vec<EndpointCandidate>, ConfigError> {
    config.validate()?;

    let ports = &config.ports[..CANDIDATES_PER_TIER];
    let mut candidates = Vec::with_capacity(ports.len() * 2);
    for &port in ports {
        candidates.push(EndpointCandidate::parse(format!(
            "{}:{port}",
            config.local_url
        ))?);
    }

    let instances = sample_instances(rng, CANDIDATES_PER_TIER, config.max_instances)?;
    for (&port, instance) in ports.iter().zip(instances) {
        let host = config
            .cloud_url
            .replace(INSTANCE_PLACEHOLDER, &instance.to_string());
        candidates.push(EndpointCandidate::parse(format!("{host}:{port}"))?);
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn generates_local_then_cloud_candidates() {
        let config = DiscoveryConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = generate(&config, &mut rng).unwrap();

        assert_eq!(candidates.len(), CANDIDATES_PER_TIER * 2);
        for (candidate, port) in candidates.iter().take(5).zip(&config.ports) {
            assert_eq!(candidate.url.host_str(), Some("127.0.0.1"));
            assert_eq!(candidate.url.port(), Some(*port));
            assert_eq!(candidate.url.scheme(), "http");
        }
        for (candidate, port) in candidates.iter().skip(5).zip(&config.ports) {
            let host = candidate.url.host_str().unwrap();
            assert!(host.starts_with('m') && host.ends_with(".mordomo.gov.pt"));
            assert_eq!(candidate.url.port(), Some(*port));
            assert_eq!(candidate.url.scheme(), "https");
        }
    }

    #[test]
    fn cloud_instances_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let instances = sample_instances(&mut rng, 5, 20).unwrap();
            assert_eq!(instances.len(), 5);
            for instance in &instances {
                assert!((1..=20).contains(instance));
            }
            let mut sorted = instances.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 5, "duplicate instance in {instances:?}");
        }
    }

    #[test]
    fn exhausting_the_pool_yields_a_permutation() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut instances = sample_instances(&mut rng, 5, 5).unwrap();
        instances.sort_unstable();
        assert_eq!(instances, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn pool_smaller_than_request_fails_instead_of_spinning() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            sample_instances(&mut rng, 5, 4),
            Err(ConfigError::InstancePoolTooSmall { max: 4, want: 5 })
        ));
    }

    #[test]
    fn extra_ports_beyond_the_tier_are_ignored() {
        let config = DiscoveryConfig {
            ports: vec![1000, 1001, 1002, 1003, 1004, 9999],
            ..DiscoveryConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let candidates = generate(&config, &mut rng).unwrap();
        assert_eq!(candidates.len(), 10);
        assert!(
            candidates
                .iter()
                .all(|candidate| candidate.url.port() != Some(9999))
        );
    }

    #[test]
    fn generation_validates_the_config_first() {
        let config = DiscoveryConfig {
            cloud_url: "https://no-placeholder.example".to_string(),
            ..DiscoveryConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generate(&config, &mut rng),
            Err(ConfigError::MissingInstancePlaceholder { .. })
        ));
    }
}
