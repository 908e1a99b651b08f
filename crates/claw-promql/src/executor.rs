//! Request execution.
//!
//! The executor compiles a request for each variable binding, sends the
//! compiled queries to a [`QueryClient`], and shapes what comes back. Batches
//! of bindings run concurrently up to [`RuntimeSettings::concurrency_limit`],
//! keep their input order, and fail fast on the first error.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregation::{aggregate_value, GroupRowMerger};
use crate::client::QueryClient;
use crate::config::RuntimeSettings;
use crate::error::{PromqlError, Result};
use crate::native::{compile_native, NativeQueryRequest, NativeQueryTemplate};
use crate::plan::{compile, CollectionRequest, PlanKind, QueryPlan};
use crate::predicate::Variables;
use crate::shaping::{shape_aggregates, shape_groups, shape_rows, QueryOutput, ResultFormatter, RowOptions};
use crate::sorting::paginate;
use crate::time::TimeSelection;
use crate::types::QueryValue;

/// The shaped output of one request, with any backend warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Shaped rows, aggregates or groups.
    pub output: QueryOutput,
    /// Advisory warnings returned by the backend.
    pub warnings: Vec<String>,
}

/// Executes compiled requests against a [`QueryClient`].
#[derive(Debug)]
pub struct QueryExecutor<C> {
    client: Arc<C>,
    settings: Arc<RuntimeSettings>,
}

impl<C> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<C: QueryClient> QueryExecutor<C> {
    /// Creates an executor owning `client`.
    #[must_use]
    pub fn new(client: C, settings: RuntimeSettings) -> Self {
        Self::with_shared_client(Arc::new(client), settings)
    }

    /// Creates an executor sharing `client`.
    #[must_use]
    pub fn with_shared_client(client: Arc<C>, settings: RuntimeSettings) -> Self {
        Self {
            client,
            settings: Arc::new(settings),
        }
    }

    /// The runtime settings.
    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// The execution client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Compiles `request` without executing it and returns every query text.
    ///
    /// # Errors
    ///
    /// Returns compilation errors.
    pub fn explain(&self, request: &CollectionRequest, variables: &Variables) -> Result<BTreeMap<String, String>> {
        compile(request, variables, &self.settings, Utc::now()).map(|plan| plan.explain())
    }

    /// Compiles and executes `request` for one binding.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and [`PromqlError::Backend`] for client failures.
    pub async fn execute(&self, request: &CollectionRequest, variables: &Variables) -> Result<QueryResult> {
        let plan = compile(request, variables, &self.settings, Utc::now())?;
        self.execute_plan(&plan).await
    }

    /// Executes a compiled plan.
    ///
    /// An unsatisfiable plan never reaches the client.
    ///
    /// # Errors
    ///
    /// Returns [`PromqlError::Backend`] for client failures.
    pub async fn execute_plan(&self, plan: &QueryPlan) -> Result<QueryResult> {
        let formatter = ResultFormatter::from_settings(&self.settings);
        let mut warnings = Vec::new();

        let output = match &plan.kind {
            PlanKind::Rows { query } => {
                let value = if plan.ok {
                    self.fetch(query, &plan.time, plan.timeout, &mut warnings)
                        .await?
                } else {
                    QueryValue::Vector(Vec::new())
                };
                let options = RowOptions {
                    flat: plan.flat,
                    order_by: &plan.order_by,
                    offset: plan.offset,
                    limit: plan.limit,
                };
                QueryOutput::Rows(shape_rows(value, &options, &formatter))
            }
            PlanKind::Aggregates { queries, specs } => {
                let mut values = BTreeMap::new();
                for (key, spec) in specs {
                    let value = match queries.get(key) {
                        Some(query) if plan.ok => {
                            let value = self
                                .fetch(query, &plan.time, plan.timeout, &mut warnings)
                                .await?;
                            aggregate_value(spec, &value)
                        }
                        _ => spec.is_count().then_some(0.0),
                    };
                    values.insert(key.clone(), value);
                }
                QueryOutput::Aggregates(shape_aggregates(values, &formatter))
            }
            PlanKind::Groups { queries, spec } => {
                let mut merger = GroupRowMerger::new(&spec.dimensions, &spec.aggregates);
                if plan.ok {
                    for (key, query) in queries {
                        let value = self
                            .fetch(query, &plan.time, plan.timeout, &mut warnings)
                            .await?;
                        merger.merge(key, &value);
                    }
                }
                let rows = paginate(merger.finish(), spec.offset, spec.limit);
                QueryOutput::Groups(shape_groups(rows, &formatter))
            }
        };

        Ok(QueryResult { output, warnings })
    }

    /// Compiles and executes a native query, or a raw query when `template`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and [`PromqlError::Backend`] for client failures.
    pub async fn execute_native(
        &self,
        template: Option<&NativeQueryTemplate>,
        request: &NativeQueryRequest,
        variables: &Variables,
    ) -> Result<QueryResult> {
        let plan = compile_native(template, request, variables, &self.settings, Utc::now())?;
        let mut warnings = Vec::new();
        let mut value = self
            .fetch(&plan.query, &plan.time, plan.timeout, &mut warnings)
            .await?;
        if let Some(filter) = &plan.filter {
            value = filter.apply(value);
        }

        let options = RowOptions {
            flat: plan.flat,
            order_by: &plan.order_by,
            offset: plan.offset,
            limit: plan.limit,
        };
        let rows = shape_rows(value, &options, &ResultFormatter::from_settings(&self.settings));
        Ok(QueryResult {
            output: QueryOutput::Rows(rows),
            warnings,
        })
    }

    /// Executes `request` once per binding; results keep binding order.
    ///
    /// No bindings runs the request once with an empty binding.
    ///
    /// # Errors
    ///
    /// Returns the first failing unit's error; the other results are
    /// discarded.
    pub async fn execute_batch(
        &self,
        request: &CollectionRequest,
        bindings: Vec<Variables>,
    ) -> Result<Vec<QueryResult>> {
        self.execute_batch_with_cancellation(request, bindings, CancellationToken::new())
            .await
    }

    /// Like [`execute_batch`](Self::execute_batch), stopping with
    /// [`PromqlError::Cancelled`] once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first failing unit's error, or [`PromqlError::Cancelled`].
    pub async fn execute_batch_with_cancellation(
        &self,
        request: &CollectionRequest,
        bindings: Vec<Variables>,
        cancel: CancellationToken,
    ) -> Result<Vec<QueryResult>> {
        let request = Arc::new(request.clone());
        self.run_batch(bindings, cancel, move |executor, variables| {
            let request = Arc::clone(&request);
            async move { executor.execute(&request, &variables).await }
        })
        .await
    }

    /// Executes a native or raw query once per binding.
    ///
    /// # Errors
    ///
    /// Returns the first failing unit's error.
    pub async fn execute_native_batch(
        &self,
        template: Option<&NativeQueryTemplate>,
        request: &NativeQueryRequest,
        bindings: Vec<Variables>,
    ) -> Result<Vec<QueryResult>> {
        self.execute_native_batch_with_cancellation(template, request, bindings, CancellationToken::new())
            .await
    }

    /// Like [`execute_native_batch`](Self::execute_native_batch), stopping
    /// with [`PromqlError::Cancelled`] once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first failing unit's error, or [`PromqlError::Cancelled`].
    pub async fn execute_native_batch_with_cancellation(
        &self,
        template: Option<&NativeQueryTemplate>,
        request: &NativeQueryRequest,
        bindings: Vec<Variables>,
        cancel: CancellationToken,
    ) -> Result<Vec<QueryResult>> {
        let template = Arc::new(template.cloned());
        let request = Arc::new(request.clone());
        self.run_batch(bindings, cancel, move |executor, variables| {
            let template = Arc::clone(&template);
            let request = Arc::clone(&request);
            async move {
                executor
                    .execute_native((*template).as_ref(), &request, &variables)
                    .await
            }
        })
        .await
    }

    async fn run_batch<T, F, Fut>(
        &self,
        mut bindings: Vec<Variables>,
        cancel: CancellationToken,
        unit: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Self, Variables) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if bindings.is_empty() {
            bindings.push(Variables::new());
        }
        let limit = self.settings.concurrency_limit;

        if bindings.len() == 1 || limit <= 1 {
            debug!(units = bindings.len(), "running batch sequentially");
            let mut results = Vec::with_capacity(bindings.len());
            for variables in bindings {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(PromqlError::Cancelled),
                    result = unit(self.clone(), variables) => result,
                };
                results.push(result?);
            }
            return Ok(results);
        }

        debug!(units = bindings.len(), limit, "running batch concurrently");
        let token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(limit));
        let unit = Arc::new(unit);
        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(bindings.len()).collect();
        let mut indices = HashMap::with_capacity(bindings.len());
        let mut tasks = JoinSet::new();

        for (index, variables) in bindings.into_iter().enumerate() {
            let executor = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let unit = Arc::clone(&unit);
            let handle = tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => Err(PromqlError::Cancelled),
                    result = async {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|_| PromqlError::Cancelled)?;
                        unit(executor, variables).await
                    } => result,
                };
                (index, result)
            });
            indices.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let failure = match joined {
                Ok((_, (index, Ok(value)))) => {
                    slots[index] = Some(value);
                    continue;
                }
                Ok((_, (index, Err(err)))) => {
                    warn!(index, error = %err, "batch unit failed");
                    err
                }
                Err(join_error) => {
                    let index = indices.get(&join_error.id()).copied().unwrap_or_default();
                    warn!(index, error = %join_error, "batch unit terminated");
                    PromqlError::TaskFailed {
                        index,
                        reason: join_error.to_string(),
                    }
                }
            };
            token.cancel();
            tasks.abort_all();
            return Err(failure);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| PromqlError::TaskFailed {
                    index,
                    reason: "unit produced no result".to_string(),
                })
            })
            .collect()
    }

    async fn fetch(
        &self,
        query: &str,
        time: &TimeSelection,
        timeout: Option<Duration>,
        warnings: &mut Vec<String>,
    ) -> Result<QueryValue> {
        debug!(query = %query, instant = time.is_instant(), "sending query");
        let response = match time {
            TimeSelection::Instant(at) => self.client.query(query, *at, timeout).await,
            TimeSelection::Range(range) => {
                self.client
                    .query_range(query, range.start, range.end, range.step, timeout)
                    .await
            }
        }
        .map_err(|source| PromqlError::Backend {
            query: query.to_string(),
            source,
        })?;

        for warning in &response.warnings {
            warn!(query = %query, warning = %warning, "backend warning");
        }
        warnings.extend(response.warnings);
        Ok(response.value)
    }
}
