//! Data tracing filter - the request/response correlation protocol
//!
//! Per trace id the filter moves through `UNSEEN -> OPEN(parent) -> CLOSED`.
//! The first request to create `PARENT-<id>` becomes the parent; its
//! response deletes both store entries and closes the trace. Requests that
//! arrive while the trace is open are children.
//!
//! | exchange         | phase    |
//! |------------------|----------|
//! | parent request   | INBOUND  |
//! | child request    | OUTBOUND |
//! | parent response  | OUTBOUND |
//! | child response   | INBOUND  |
//!
//! The request phase comes from whether this request created `DATA-<id>`,
//! the response phase from whether `PARENT-<id>` holds this connection id.
//! The two creates are separate store calls, so concurrent requests for one
//! trace id can end up with a phase that disagrees with parent ownership.

use datatrace_core::config::{ConfigResult, FilterConfig};
use datatrace_core::headers::{HeaderAccess, DATA, DATA_OVERRIDE, REQUEST_ID};
use datatrace_core::store::{data_key, parent_key, trace_id_of};
use datatrace_core::{
    CorrelationStore, FilterMetrics, Phase, PolicyError, PolicyEvaluator, NO_DATA,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Stream-local state of one request/response exchange
///
/// Owned by the host for the lifetime of the exchange. The request path
/// records the trace id here so the response path can find the trace again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeContext {
    connection_id: u64,
    trace_id: Option<String>,
}

impl ExchangeContext {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            trace_id: None,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Trace this exchange belongs to, if its request carried one
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    fn mark(&mut self, trace_id: &str) {
        self.trace_id = Some(trace_id.to_string());
    }
}

/// What the host should do with the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStatus {
    /// Continue with the (possibly rewritten) headers
    Continue,
    /// Abort the exchange
    Reset(PolicyError),
}

impl FilterStatus {
    pub fn is_continue(&self) -> bool {
        matches!(self, FilterStatus::Continue)
    }
}

/// The data tracing filter
///
/// One instance serves every exchange; all shared state lives in the store.
pub struct DataTracingFilter {
    store: Arc<dyn CorrelationStore>,
    evaluator: PolicyEvaluator,
    metrics: Arc<FilterMetrics>,
}

impl DataTracingFilter {
    pub fn new(evaluator: PolicyEvaluator, store: Arc<dyn CorrelationStore>) -> Self {
        Self {
            store,
            evaluator,
            metrics: Arc::new(FilterMetrics::new()),
        }
    }

    /// Build a filter from configuration, sharing `store`
    pub fn from_config(
        config: &FilterConfig,
        store: Arc<dyn CorrelationStore>,
    ) -> ConfigResult<Self> {
        let evaluator = config.evaluator()?;
        info!(
            actions = evaluator.policy().len(),
            override_mode = ?evaluator.override_mode(),
            "Data tracing filter configured"
        );
        Ok(Self::new(evaluator, store))
    }

    /// Builder: report into an existing metrics collector
    pub fn with_metrics(mut self, metrics: Arc<FilterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<FilterMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn CorrelationStore> {
        &self.store
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// Handle request headers
    ///
    /// Requests without `x-request-id` pass through untouched. On rejection
    /// neither the headers' `x-data` nor the store are written; entries
    /// created for the trace are kept.
    pub fn on_request<H>(&self, ctx: &mut ExchangeContext, headers: &mut H) -> FilterStatus
    where
        H: HeaderAccess + ?Sized,
    {
        FilterMetrics::incr(&self.metrics.requests);

        let Some(trace_id) = headers.non_empty_header(REQUEST_ID) else {
            FilterMetrics::incr(&self.metrics.requests_untraced);
            trace!(connection_id = ctx.connection_id, "No trace id, passing request through");
            return FilterStatus::Continue;
        };

        let connection_id = ctx.connection_id.to_string();
        let data_entry = data_key(&trace_id);

        let opened = self.store.create(&parent_key(&trace_id), &connection_id);
        let phase = if self.store.create(&data_entry, NO_DATA) {
            Phase::Inbound
        } else {
            Phase::Outbound
        };

        if opened {
            FilterMetrics::incr(&self.metrics.traces_opened);
            info!(trace_id = %trace_id, connection_id = %connection_id, "Opened trace");
        } else {
            FilterMetrics::incr(&self.metrics.child_requests);
        }
        if opened != (phase == Phase::Inbound) {
            warn!(
                trace_id = %trace_id,
                connection_id = %connection_id,
                opened,
                phase = %phase,
                "Trace ownership and request phase disagree"
            );
        }

        ctx.mark(&trace_id);

        let labels = headers
            .non_empty_header(DATA)
            .or_else(|| self.store.get(&data_entry))
            .unwrap_or_else(|| NO_DATA.to_string());
        let overrides = headers.remove_header(DATA_OVERRIDE);

        debug!(
            trace_id = %trace_id,
            connection_id = %connection_id,
            phase = %phase,
            labels = %labels,
            "Evaluating request"
        );

        match self.evaluate(&labels, phase, overrides.as_deref()) {
            Ok(result) => {
                headers.set_header(DATA, &result);
                self.store.put(&data_entry, &result);
                FilterStatus::Continue
            }
            Err(err) => self.reject(&trace_id, phase, err),
        }
    }

    /// Handle response headers
    ///
    /// The parent's response closes the trace. A child's response writes
    /// its result back only while the trace is still open.
    pub fn on_response<H>(&self, ctx: &ExchangeContext, headers: &mut H) -> FilterStatus
    where
        H: HeaderAccess + ?Sized,
    {
        let Some(trace_id) = ctx.trace_id() else {
            return FilterStatus::Continue;
        };
        FilterMetrics::incr(&self.metrics.responses);

        let connection_id = ctx.connection_id.to_string();
        let data_entry = data_key(trace_id);
        let is_parent =
            self.store.get(&parent_key(trace_id)).as_deref() == Some(connection_id.as_str());

        let overrides = headers.remove_header(DATA_OVERRIDE);
        let header_labels = headers.non_empty_header(DATA);

        let (phase, labels) = if is_parent {
            let labels = header_labels
                .or_else(|| self.store.get(&data_entry))
                .unwrap_or_else(|| NO_DATA.to_string());
            (Phase::Outbound, labels)
        } else {
            (Phase::Inbound, header_labels.unwrap_or_else(|| NO_DATA.to_string()))
        };

        debug!(
            trace_id = %trace_id,
            connection_id = %connection_id,
            is_parent,
            phase = %phase,
            labels = %labels,
            "Evaluating response"
        );

        let status = match self.evaluate(&labels, phase, overrides.as_deref()) {
            Ok(result) => {
                headers.set_header(DATA, &result);
                if !is_parent && !self.store.update(&data_entry, &result) {
                    debug!(trace_id = %trace_id, "Trace already closed, dropping child result");
                }
                FilterStatus::Continue
            }
            Err(err) => self.reject(trace_id, phase, err),
        };

        if is_parent {
            self.close_trace(trace_id);
        }
        status
    }

    /// Delete both entries of a trace. Returns whether the trace was open.
    pub fn close_trace(&self, trace_id: &str) -> bool {
        self.store.delete(&data_key(trace_id));
        let closed = self.store.delete(&parent_key(trace_id));
        if closed {
            FilterMetrics::incr(&self.metrics.traces_closed);
            info!(trace_id = %trace_id, "Closed trace");
        }
        closed
    }

    /// Evict every trace with an entry older than `max_age`
    ///
    /// Ages are checked again at delete time, so a trace reopened under the
    /// same id after the expired keys were listed is left alone. A trace is
    /// evicted when its `PARENT-` entry is expired, or when it has no
    /// `PARENT-` entry and its `DATA-` entry is expired.
    ///
    /// Returns the number of traces evicted.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let trace_ids: BTreeSet<String> = self
            .store
            .expired(max_age)
            .iter()
            .filter_map(|key| trace_id_of(key))
            .map(str::to_string)
            .collect();

        let mut evicted = 0;
        for trace_id in &trace_ids {
            let parent_entry = parent_key(trace_id);
            let parent = self.store.delete_if_expired(&parent_entry, max_age);
            let data = (parent || self.store.get(&parent_entry).is_none())
                && self.store.delete_if_expired(&data_key(trace_id), max_age);
            if data || parent {
                evicted += 1;
                debug!(trace_id = %trace_id, "Evicted expired trace");
            }
        }

        FilterMetrics::add(&self.metrics.traces_evicted, evicted as u64);
        evicted
    }

    fn evaluate(
        &self,
        labels: &str,
        phase: Phase,
        overrides: Option<&str>,
    ) -> Result<String, PolicyError> {
        let result = self.evaluator.evaluate(labels, phase, overrides)?;
        FilterMetrics::add(
            &self.metrics.malformed_overrides,
            result.dropped_overrides as u64,
        );
        Ok(result.labels)
    }

    fn reject(&self, trace_id: &str, phase: Phase, err: PolicyError) -> FilterStatus {
        FilterMetrics::incr(&self.metrics.rejections);
        warn!(trace_id = %trace_id, phase = %phase, error = %err, "Rejecting exchange");
        FilterStatus::Reset(err)
    }
}
