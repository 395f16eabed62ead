use async_trait::async_trait;
use owo_colors::OwoColorize;
use std::fmt;
use std::sync::Arc;

use crate::util::Error;
use crate::util::colors::{FG1, FG2};

/// Opaque identity of one reconciliation request. Hooks observe it; they
/// never mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(kind: &'static str, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// One link of the per-controller hook chain. A failing `before`
/// short-circuits the reconciliation; `after` always runs for every hook
/// whose `before` was entered, error path included.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, _request: &ReconcileRequest) -> Result<(), Error> {
        Ok(())
    }

    async fn after(&self, _request: &ReconcileRequest, _error: Option<&Error>) {}
}

/// Ordered hook chain wrapping a controller's reconcile body. `before`s run
/// in registration order, `after`s in reverse.
#[derive(Clone, Default)]
pub struct Chain {
    hooks: Arc<Vec<Arc<dyn Hook>>>,
}

impl Chain {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self {
            hooks: Arc::new(hooks),
        }
    }

    /// The chain used when middleware is disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn wrap<T, Fut>(&self, request: &ReconcileRequest, body: Fut) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut entered = 0;
        let mut short_circuit: Option<Error> = None;
        for hook in self.hooks.iter() {
            entered += 1;
            if let Err(e) = hook.before(request).await {
                short_circuit = Some(e);
                break;
            }
        }

        let result = match short_circuit {
            Some(e) => Err(e),
            None => body.await,
        };

        for hook in self.hooks[..entered].iter().rev() {
            hook.after(request, result.as_ref().err()).await;
        }
        result
    }
}

/// Logs each reconciliation outcome; the default chain member.
pub struct LoggingHook;

#[async_trait]
impl Hook for LoggingHook {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn after(&self, request: &ReconcileRequest, error: Option<&Error>) {
        if let Some(error) = error {
            eprintln!(
                "❌ {}{}{}",
                format!("{request}").color(FG2),
                " reconcile failed: ".color(FG1),
                format!("{error}").red(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHook {
        tag: &'static str,
        fail_before: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn before(&self, _request: &ReconcileRequest) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("before:{}", self.tag));
            if self.fail_before {
                return Err(Error::Middleware {
                    hook: self.tag.to_string(),
                    object: "ns/obj".to_string(),
                    message: "rejected".to_string(),
                });
            }
            Ok(())
        }

        async fn after(&self, _request: &ReconcileRequest, error: Option<&Error>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("after:{}:{}", self.tag, error.is_some()));
        }
    }

    fn chain_of(log: &Arc<Mutex<Vec<String>>>, specs: &[(&'static str, bool)]) -> Chain {
        Chain::new(
            specs
                .iter()
                .map(|(tag, fail)| {
                    Arc::new(RecordingHook {
                        tag,
                        fail_before: *fail,
                        log: log.clone(),
                    }) as Arc<dyn Hook>
                })
                .collect(),
        )
    }

    fn request() -> ReconcileRequest {
        ReconcileRequest::new("Pool", "default", "p")
    }

    #[tokio::test]
    async fn befores_forward_afters_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&log, &[("a", false), ("b", false)]);
        let out = chain.wrap(&request(), async { Ok(1) }).await.unwrap();
        assert_eq!(out, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:b:false", "after:a:false"]
        );
    }

    #[tokio::test]
    async fn failing_before_short_circuits_but_afters_still_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&log, &[("a", false), ("b", true), ("c", false)]);
        let out: Result<i32, _> = chain
            .wrap(&request(), async {
                panic!("body must not run after a failed before");
            })
            .await;
        assert!(out.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:b:true", "after:a:true"]
        );
    }

    #[tokio::test]
    async fn body_error_reaches_every_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain_of(&log, &[("a", false)]);
        let out: Result<i32, _> = chain
            .wrap(&request(), async {
                Err(Error::UserInput("boom".to_string()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "after:a:true"]);
    }

    #[tokio::test]
    async fn empty_chain_is_transparent() {
        let chain = Chain::disabled();
        let out = chain.wrap(&request(), async { Ok("x") }).await.unwrap();
        assert_eq!(out, "x");
    }
}
