//! Smart sync: decide push, pull or nothing from cumulative usage
//!
//! Whichever side has more recorded usage is treated as the fresher one.
//! Differences up to the caller's threshold count as the same.

use std::time::Duration;

use tracing::{info, warn};

use crate::record::UsageSample;
use crate::remote::{RemoteTransport, with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonStatus {
    LocalAhead,
    CloudAhead,
    Similar,
    /// No remote record could be obtained; pushing loses nothing
    RemoteNotFound,
}

/// What a caller should do for a given comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Push,
    Pull,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncComparison {
    pub status: ComparisonStatus,
    pub local_usage: Duration,
    pub remote_usage: Option<Duration>,
    /// Absolute usage difference; direction is carried by `status`
    pub magnitude: Duration,
}

impl SyncComparison {
    #[must_use]
    pub fn recommendation(&self) -> Recommendation {
        match self.status {
            ComparisonStatus::LocalAhead | ComparisonStatus::RemoteNotFound => {
                Recommendation::Push
            }
            ComparisonStatus::CloudAhead => Recommendation::Pull,
            ComparisonStatus::Similar => Recommendation::Nothing,
        }
    }
}

/// Classify local against remote usage.
///
/// There is no default threshold; zero means any difference counts.
#[must_use]
pub fn compare(
    local: &UsageSample,
    remote: Option<&UsageSample>,
    threshold: Duration,
) -> SyncComparison {
    let local_usage = local.cumulative();

    let Some(remote) = remote else {
        return SyncComparison {
            status: ComparisonStatus::RemoteNotFound,
            local_usage,
            remote_usage: None,
            magnitude: Duration::ZERO,
        };
    };

    let remote_usage = remote.cumulative();
    let magnitude = remote_usage.abs_diff(local_usage);
    let status = if magnitude <= threshold {
        ComparisonStatus::Similar
    } else if remote_usage > local_usage {
        ComparisonStatus::CloudAhead
    } else {
        ComparisonStatus::LocalAhead
    };

    SyncComparison {
        status,
        local_usage,
        remote_usage: Some(remote_usage),
        magnitude,
    }
}

/// Fetch the remote usage through `transport` and compare.
///
/// A fetch error or timeout is reported as
/// [`ComparisonStatus::RemoteNotFound`], same as an absent record set.
pub async fn fetch_and_compare<T>(
    transport: &T,
    remote_dir: &str,
    local: &UsageSample,
    threshold: Duration,
    timeout: Duration,
) -> SyncComparison
where
    T: RemoteTransport + ?Sized,
{
    let remote = match with_timeout(timeout, transport.fetch_record_set(remote_dir)).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(remote_dir, error = %e, "could not fetch remote record set, treating as not found");
            None
        }
    };

    let comparison = compare(
        local,
        remote.as_ref().map(|r| &r.metadata.usage),
        threshold,
    );
    info!(
        status = ?comparison.status,
        magnitude_secs = comparison.magnitude.as_secs(),
        "compared usage"
    );
    comparison
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;

    use crate::record::RecordSet;
    use crate::remote::{Direction, TransportError};

    fn usage(secs: u64) -> UsageSample {
        UsageSample::new(Duration::from_secs(secs), 0)
    }

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    #[test]
    fn test_remote_missing() {
        let c = compare(&UsageSample::default(), None, TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::RemoteNotFound);
        assert_eq!(c.recommendation(), Recommendation::Push);
    }

    #[test]
    fn test_small_difference_is_similar() {
        let c = compare(&usage(7_200), Some(&usage(7_205)), TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::Similar);
        assert_eq!(c.recommendation(), Recommendation::Nothing);
    }

    #[test]
    fn test_cloud_ahead() {
        let c = compare(&usage(3_600), Some(&usage(10_800)), TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::CloudAhead);
        assert_eq!(c.magnitude, Duration::from_secs(7_200));
        assert_eq!(c.recommendation(), Recommendation::Pull);
    }

    #[test]
    fn test_local_ahead() {
        let c = compare(&usage(10_800), Some(&usage(3_600)), TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::LocalAhead);
        assert_eq!(c.magnitude, Duration::from_secs(7_200));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let c = compare(&usage(0), Some(&usage(600)), TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::Similar);
        let c = compare(&usage(0), Some(&usage(601)), TEN_MINUTES);
        assert_eq!(c.status, ComparisonStatus::CloudAhead);
    }

    #[test]
    fn test_zero_threshold_counts_any_difference() {
        let c = compare(&usage(100), Some(&usage(101)), Duration::ZERO);
        assert_eq!(c.status, ComparisonStatus::CloudAhead);
        let c = compare(&usage(100), Some(&usage(100)), Duration::ZERO);
        assert_eq!(c.status, ComparisonStatus::Similar);
    }

    #[test]
    fn test_swapping_sides_swaps_direction() {
        let samples = [0, 5, 599, 600, 601, 3_600, 86_400];
        for threshold in [Duration::ZERO, Duration::from_secs(60), TEN_MINUTES] {
            for a in samples {
                for b in samples {
                    let ab = compare(&usage(a), Some(&usage(b)), threshold);
                    let ba = compare(&usage(b), Some(&usage(a)), threshold);
                    assert_eq!(
                        ab.status == ComparisonStatus::LocalAhead,
                        ba.status == ComparisonStatus::CloudAhead,
                        "a={a} b={b} threshold={threshold:?}"
                    );
                    assert_eq!(ab.magnitude, ba.magnitude);
                }
            }
        }
    }

    /// Answers fetches with a fixed result, or never
    enum FixedRemote {
        Found(RecordSet),
        Missing,
        Broken,
        Hangs,
    }

    #[async_trait]
    impl RemoteTransport for FixedRemote {
        async fn fetch_record_set(
            &self,
            _remote_dir: &str,
        ) -> Result<Option<RecordSet>, TransportError> {
            match self {
                Self::Found(set) => Ok(Some(set.clone())),
                Self::Missing => Ok(None),
                Self::Broken => Err(TransportError::CommandFailed {
                    command: "cat".into(),
                    status: Some(1),
                    stderr: "boom".into(),
                }),
                Self::Hangs => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(None)
                }
            }
        }

        async fn put_record_set(&self, _: &str, _: &RecordSet) -> Result<(), TransportError> {
            Ok(())
        }

        async fn transfer(&self, _: &Path, _: &str, _: Direction) -> Result<(), TransportError> {
            Ok(())
        }

        async fn copy(&self, _: &str, _: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn purge(&self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fetch_found() {
        let mut remote = RecordSet::new();
        remote.add_usage(Duration::from_secs(10_800), 1);
        let transport = FixedRemote::Found(remote);

        let c = fetch_and_compare(&transport, "r:", &usage(3_600), TEN_MINUTES, TEN_MINUTES).await;
        assert_eq!(c.status, ComparisonStatus::CloudAhead);
    }

    #[tokio::test]
    async fn test_fetch_missing_and_broken_are_not_found() {
        for transport in [FixedRemote::Missing, FixedRemote::Broken] {
            let c = fetch_and_compare(&transport, "r:", &usage(1), TEN_MINUTES, TEN_MINUTES).await;
            assert_eq!(c.status, ComparisonStatus::RemoteNotFound);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_not_found() {
        let c = fetch_and_compare(
            &FixedRemote::Hangs,
            "r:",
            &usage(1),
            TEN_MINUTES,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(c.status, ComparisonStatus::RemoteNotFound);
    }
}
