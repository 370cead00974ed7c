//! Suite driver.
//!
//! Owns the suite-level fixtures (admin client, standard user, suite session)
//! and runs cases in parallel, each with its own session. A case failure,
//! timeout or panic fails only that case; everything it created is released
//! before its report is produced.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::matrix::{Expansion, Identity, TestCase};
use crate::session::{panic_message, CleanupError, Session};
use crate::users::{create_standard_user, impersonating_client};
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use kube::Client;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    /// Not run; never counted as a failure
    Skipped(String),
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "PASS"),
            Self::Failed(reason) => write!(f, "FAIL: {reason}"),
            Self::Skipped(reason) => write!(f, "SKIP: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub outcome: CaseOutcome,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl CaseReport {
    /// A failure that happened outside of any case body
    #[must_use]
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: CaseOutcome::Failed(reason.into()),
            duration: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: CaseOutcome::Skipped(reason.into()),
            duration: Duration::ZERO,
            started_at: Utc::now(),
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn extend(&mut self, reports: impl IntoIterator<Item = CaseReport>) {
        self.cases.extend(reports);
    }

    fn count(&self, matches: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| matches(&c.outcome)).count()
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Passed))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed(_)))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped(_)))
    }

    /// No case failed; skips are allowed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn log_summary(&self) {
        for case in &self.cases {
            match &case.outcome {
                CaseOutcome::Failed(_) => error!(case = %case.name, duration = ?case.duration, "{}", case.outcome),
                _ => info!(case = %case.name, duration = ?case.duration, "{}", case.outcome),
            }
        }
        info!(
            passed = self.passed(),
            failed = self.failed(),
            skipped = self.skipped(),
            "Suite finished"
        );
    }
}

/// Everything a single case gets to work with
#[derive(Clone)]
pub struct CaseContext {
    pub case: TestCase,
    pub client: Client,
    pub session: Session,
    pub config: Arc<HarnessConfig>,
}

/// Run `body` once per item, at most `parallelism` at a time.
///
/// Each run gets a fresh session that is drained before its report is built.
/// Reports come back in input order.
pub async fn run_isolated<C, F, Fut>(items: Vec<(String, C)>, parallelism: usize, body: F) -> Vec<CaseReport>
where
    F: Fn(C, Session) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let body = &body;
    stream::iter(items.into_iter().map(|(name, item)| async move {
        let started_at = Utc::now();
        let clock = Instant::now();
        let span = tracing::info_span!("case", case = %name);

        let run = Session::new(name.clone()).scope(move |session| body(item, session));
        let outcome = match AssertUnwindSafe(run.instrument(span)).catch_unwind().await {
            Ok(Ok(())) => CaseOutcome::Passed,
            Ok(Err(e)) => {
                warn!(case = %name, error = %e, "Case failed");
                CaseOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(case = %name, panic = %message, "Case panicked");
                CaseOutcome::Failed(format!("panicked: {message}"))
            }
        };

        CaseReport {
            name,
            outcome,
            duration: clock.elapsed(),
            started_at,
        }
    }))
    .buffered(parallelism.max(1))
    .collect()
    .await
}

/// Suite-level fixtures shared read-only by every case
pub struct SuiteContext {
    config: Arc<HarnessConfig>,
    admin: Client,
    standard_user: Option<Client>,
    session: Session,
}

impl SuiteContext {
    /// Connect with the ambient kubeconfig and create the suite fixtures.
    ///
    /// Any failure here is a `HarnessError::Setup`; fixtures created before
    /// the failure are released again.
    pub async fn setup(config: HarnessConfig) -> Result<Self> {
        let kube_config = kube::Config::infer()
            .await
            .map_err(|e| HarnessError::Setup(format!("failed to load kubeconfig: {e}")))?;
        let admin = Client::try_from(kube_config.clone())
            .map_err(|e| HarnessError::Setup(format!("failed to create admin client: {e}")))?;
        let session = Session::new("suite");

        let standard_user = if config.standard_user.enabled {
            let created = async {
                let user = create_standard_user(&admin, &session, &config.standard_user.global_role).await?;
                impersonating_client(&kube_config, &user)
            }
            .await;
            match created {
                Ok(client) => Some(client),
                Err(e) => {
                    if let Err(cleanup) = session.cleanup().await {
                        error!(error = %cleanup, "Cleanup after failed setup also failed");
                    }
                    return Err(HarnessError::Setup(format!("failed to create standard user: {e}")));
                }
            }
        } else {
            info!("Standard user disabled; standard-user cases will be skipped");
            None
        };

        info!(namespace = %config.namespace, "Suite setup complete");
        Ok(Self::from_parts(Arc::new(config), admin, standard_user, session))
    }

    #[must_use]
    pub fn from_parts(
        config: Arc<HarnessConfig>,
        admin: Client,
        standard_user: Option<Client>,
        session: Session,
    ) -> Self {
        Self {
            config,
            admin,
            standard_user,
            session,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    #[must_use]
    pub fn admin(&self) -> &Client {
        &self.admin
    }

    /// Suite-lifetime session; fixtures shared by several cases go here
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Client acting as `identity`, `None` when that identity is disabled
    #[must_use]
    pub fn client_for(&self, identity: Identity) -> Option<Client> {
        match identity {
            Identity::Admin => Some(self.admin.clone()),
            Identity::StandardUser => self.standard_user.clone(),
        }
    }

    /// Run every case through `body` with its own session and client
    pub async fn run_cases<F, Fut>(&self, cases: Vec<TestCase>, body: F) -> Vec<CaseReport>
    where
        F: Fn(CaseContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut reports: Vec<Option<CaseReport>> = vec![None; cases.len()];
        let mut slots = Vec::new();
        let mut runnable = Vec::new();
        for (index, case) in cases.into_iter().enumerate() {
            match self.client_for(case.identity) {
                Some(client) => {
                    slots.push(index);
                    runnable.push((case.name.clone(), (case, client)));
                }
                None => {
                    let reason = format!("{} is disabled", case.identity);
                    reports[index] = Some(CaseReport::skipped(case.name, reason));
                }
            }
        }

        let config = &self.config;
        let ran = run_isolated(runnable, self.config.parallelism, |(case, client), session| {
            body(CaseContext {
                case,
                client,
                session,
                config: config.clone(),
            })
        })
        .await;

        for (slot, report) in slots.into_iter().zip(ran) {
            reports[slot] = Some(report);
        }
        reports.into_iter().flatten().collect()
    }

    /// Like `run_cases`, reporting a skipped expansion as one skipped case
    pub async fn run_expansion<F, Fut>(&self, label: &str, expansion: Expansion, body: F) -> Vec<CaseReport>
    where
        F: Fn(CaseContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match expansion {
            Expansion::Skip { reason } => {
                info!(suite = %label, reason = %reason, "Skipping");
                vec![CaseReport::skipped(label, reason)]
            }
            Expansion::Cases(cases) => self.run_cases(cases, body).await,
        }
    }

    /// Drain the suite session
    pub async fn teardown(self) -> std::result::Result<(), CleanupError> {
        self.session.cleanup().await
    }
}
