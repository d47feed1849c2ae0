//! Dual-Array (HyperMetro) Attacher
//!
//! Runs every operation against both arrays of a HyperMetro pair. Attach goes
//! local first, then remote, and never rolls back a local mapping when the
//! remote side fails. Detach and unstage run on both sides concurrently and
//! fail if either side fails.

use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::error;

pub struct MetroAttacher {
    local: Box<dyn Attacher>,
    remote: Box<dyn Attacher>,
}

impl MetroAttacher {
    pub fn new(local: Box<dyn Attacher>, remote: Box<dyn Attacher>) -> Self {
        Self { local, remote }
    }
}

fn partial(volume: &str, side: ArraySide, source: Error) -> Error {
    Error::MetroPartialFailure {
        volume: volume.to_string(),
        side,
        source: Box::new(source),
    }
}

/// Fold both sides' results; both failing is reported as such, not as partial
fn reconcile<T>(
    volume: &str,
    local: Result<T>,
    remote: Result<T>,
    combine: impl FnOnce(T, T) -> T,
) -> Result<T> {
    match (local, remote) {
        (Ok(l), Ok(r)) => Ok(combine(l, r)),
        (Err(e), Ok(_)) => Err(partial(volume, ArraySide::Local, e)),
        (Ok(_), Err(e)) => Err(partial(volume, ArraySide::Remote, e)),
        (Err(local), Err(remote)) => {
            error!("Both sides of HyperMetro volume {} failed", volume);
            Err(Error::MetroBothSidesFailed {
                volume: volume.to_string(),
                local: Box::new(local),
                remote: Box::new(remote),
            })
        }
    }
}

#[async_trait]
impl Attacher for MetroAttacher {
    /// The local array's protocol is canonical for the pair
    fn protocol(&self) -> Protocol {
        self.local.protocol()
    }

    async fn controller_attach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<MappingInfo> {
        let local = self.local.controller_attach(ctx, lun_name, params).await?;

        let remote = self
            .remote
            .controller_attach(ctx, lun_name, params)
            .await
            .map_err(|e| {
                error!(
                    "Remote attach of HyperMetro volume {} failed, local mapping kept: {}",
                    lun_name, e
                );
                partial(lun_name, ArraySide::Remote, e)
            })?;

        Ok(local.merge_remote(remote))
    }

    async fn controller_detach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<Option<String>> {
        let (local, remote) = futures::join!(
            self.local.controller_detach(ctx, lun_name, params),
            self.remote.controller_detach(ctx, lun_name, params)
        );
        reconcile(lun_name, local, remote, |l, r| l.or(r))
    }

    async fn node_unstage(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<DisconnectInfo> {
        let (local, remote) = futures::join!(
            self.local.node_unstage(ctx, lun_name, params),
            self.remote.node_unstage(ctx, lun_name, params)
        );
        reconcile(lun_name, local, remote, |mut l, r| {
            if l.lun_wwn.is_none() {
                l.lun_wwn = r.lun_wwn;
            }
            l
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted attacher that records calls
    struct FakeAttacher {
        backend: &'static str,
        fail: bool,
        calls: Arc<AtomicU32>,
    }

    impl FakeAttacher {
        fn boxed(backend: &'static str, fail: bool, calls: &Arc<AtomicU32>) -> Box<dyn Attacher> {
            Box::new(Self {
                backend,
                fail,
                calls: Arc::clone(calls),
            })
        }

        fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Transport {
                    backend: self.backend.to_string(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Attacher for FakeAttacher {
        fn protocol(&self) -> Protocol {
            Protocol::Fc
        }

        async fn controller_attach(
            &self,
            _ctx: &RequestContext,
            _lun_name: &str,
            _params: &Parameters,
        ) -> Result<MappingInfo> {
            self.check()?;
            let mut mapping = MappingInfo::new(Protocol::Fc);
            mapping.lun_wwn = Some("6001".into());
            mapping.host_lun_ids = vec![1];
            mapping.target_wwns = vec![format!("{}-wwn", self.backend)];
            Ok(mapping)
        }

        async fn controller_detach(
            &self,
            _ctx: &RequestContext,
            _lun_name: &str,
            _params: &Parameters,
        ) -> Result<Option<String>> {
            self.check()?;
            Ok(Some("6001".into()))
        }

        async fn node_unstage(
            &self,
            _ctx: &RequestContext,
            _lun_name: &str,
            _params: &Parameters,
        ) -> Result<DisconnectInfo> {
            self.check()?;
            Ok(DisconnectInfo {
                protocol: Protocol::Fc,
                lun_wwn: Some("6001".into()),
            })
        }
    }

    fn counters() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)))
    }

    #[tokio::test]
    async fn test_attach_runs_both_sides() {
        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", false, &l),
            FakeAttacher::boxed("b", false, &r),
        );
        let mapping = metro
            .controller_attach(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await
            .unwrap();
        assert_eq!(l.load(Ordering::SeqCst), 1);
        assert_eq!(r.load(Ordering::SeqCst), 1);
        assert_eq!(mapping.target_wwns, vec!["a-wwn", "b-wwn"]);
        assert_eq!(mapping.host_lun_ids, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_local_attach_failure_skips_remote() {
        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", true, &l),
            FakeAttacher::boxed("b", false, &r),
        );
        let res = metro
            .controller_attach(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await;
        assert_matches!(res, Err(Error::Transport { .. }));
        assert_eq!(r.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_attach_failure_is_partial() {
        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", false, &l),
            FakeAttacher::boxed("b", true, &r),
        );
        let res = metro
            .controller_attach(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await;
        assert_matches!(
            res,
            Err(Error::MetroPartialFailure {
                side: ArraySide::Remote,
                ..
            })
        );
        assert_eq!(l.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detach_fails_if_either_side_fails() {
        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", true, &l),
            FakeAttacher::boxed("b", false, &r),
        );
        let res = metro
            .controller_detach(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await;
        assert_matches!(
            res,
            Err(Error::MetroPartialFailure {
                side: ArraySide::Local,
                ..
            })
        );
        // both sides were still attempted
        assert_eq!(l.load(Ordering::SeqCst), 1);
        assert_eq!(r.load(Ordering::SeqCst), 1);

        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", false, &l),
            FakeAttacher::boxed("b", false, &r),
        );
        let info = metro
            .node_unstage(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await
            .unwrap();
        assert_eq!(info.lun_wwn.as_deref(), Some("6001"));
        assert_eq!(metro.protocol(), Protocol::Fc);
    }

    #[tokio::test]
    async fn test_detach_failing_on_both_sides_keeps_both_errors() {
        let (l, r) = counters();
        let metro = MetroAttacher::new(
            FakeAttacher::boxed("a", true, &l),
            FakeAttacher::boxed("b", true, &r),
        );
        let err = metro
            .controller_detach(&RequestContext::new("t"), "lun-1", &Parameters::new())
            .await
            .unwrap_err();

        assert_ne!(err.kind(), ErrorKind::PartialFailure);
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let message = err.to_string();
        assert!(message.contains("backend a"));
        assert!(message.contains("backend b"));
        assert_matches!(
            err,
            Error::MetroBothSidesFailed { local, remote, .. }
                if matches!(*local, Error::Transport { .. }) && matches!(*remote, Error::Transport { .. })
        );
    }
}
