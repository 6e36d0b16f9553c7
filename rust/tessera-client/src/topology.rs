//! Topology management.
//!
//! Three cooperating on-demand tasks keep the routing state current, each
//! guarded by a pending flag so at most one instance is queued at a time:
//!
//! - the **subscribe task** registers for topology pushes on one
//!   connection and primes the topology and procedure catalog;
//! - the **topology refresh task** re-reads topology when a connection
//!   appears without a cluster-side change;
//! - the **connection task** discovers addresses for unconnected hosts
//!   and connects to them, in two stages so no blocking connect ever runs
//!   on a network read task.
//!
//! A separate recovery task reconnects from the historical address set
//! when the last connection drops. The partition-key cache refreshes on
//! demand for all-partition calls, with a single in-flight refresh and
//! queued waiters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tessera_wire::{ClientResponse, Hashinator, ParamType, ParamValue, ResultTable, Status};
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::connection::Connection;

pub(crate) const RESUBSCRIPTION_DELAY: Duration = Duration::from_secs(5);
pub(crate) const RESUBSCRIPTION_FAILURE_DELAY: Duration = Duration::from_secs(120);
pub(crate) const TOPO_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// How many catalog-parse failures get individually logged.
const MAX_BAD_JSON_LOGS: u32 = 10;

/// Facts about one procedure, from the cluster's catalog.
#[derive(Debug, Clone)]
pub(crate) struct ProcInfo {
    pub read_only: bool,
    /// Index of the partition parameter; `None` for multi-partition
    /// procedures.
    pub partition_parameter: Option<i32>,
    pub parameter_type: Option<ParamType>,
}

/// The JSON document in the catalog's procedure rows. Unknown fields are
/// ignored; bad documents are counted and skipped.
#[derive(Deserialize)]
struct ProcJson {
    #[serde(rename = "readOnly")]
    read_only: bool,
    #[serde(rename = "singlePartition")]
    single_partition: bool,
    #[serde(rename = "partitionParameter", default)]
    partition_parameter: Option<i32>,
    #[serde(rename = "partitionParameterType", default)]
    partition_parameter_type: Option<i32>,
}

impl ClientInner {
    /// Common checks on responses to internally-generated system calls.
    fn check_system_response(
        &self,
        response: Option<&ClientResponse>,
        what: &str,
        min_table_count: usize,
    ) -> bool {
        match response {
            None => {
                self.log_error(&format!("Call to {what} completed exceptionally"));
                false
            }
            Some(resp) if resp.status().is_success() => {
                if resp.results().len() < min_table_count {
                    self.log_error(&format!(
                        "Unexpected results from {what}; needed {min_table_count} tables, got {}",
                        resp.results().len()
                    ));
                    false
                } else {
                    true
                }
            }
            Some(resp) => {
                if resp.status() != Status::ConnectionLost {
                    self.log_error(&format!(
                        "Unexpected error {} returned from {what}",
                        resp.status().code()
                    ));
                }
                false
            }
        }
    }

    // ========================================================================
    // Subscription
    // ========================================================================

    /// Make sure a topology subscription exists, scheduling the subscribe
    /// task if none does. Returns true when a subscription is in place or
    /// now pending.
    pub(crate) fn ensure_subscription(self: &Arc<Self>, delay: Duration) -> bool {
        let has_connections = !self.connection_list.read().unwrap().is_empty();
        let subscribed = self.conn_state.lock().unwrap().subscribed.is_some();
        if self.is_shutdown() || !has_connections || subscribed {
            return false;
        }
        if !self.subscription_pending.swap(true, Ordering::SeqCst) {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.subscriber_task().await;
            });
        }
        true
    }

    async fn subscriber_task(self: Arc<Self>) {
        if self.is_shutdown() {
            self.subscription_pending.store(false, Ordering::SeqCst);
            return;
        }
        let Some(cxn) = self.arbitrary_connection() else {
            // All connections went down after we were queued; the next
            // connection-up event recovers.
            self.subscription_pending.store(false, Ordering::SeqCst);
            return;
        };
        self.conn_state.lock().unwrap().subscribed = Some(cxn.clone());
        self.subscription_pending.store(false, Ordering::SeqCst);

        let subscribe_rx = self.call_system_procedure(
            &cxn,
            "@Subscribe",
            vec![ParamValue::Str("TOPOLOGY".into())],
        );
        let topo_rx = self.call_system_procedure(
            &cxn,
            "@Statistics",
            vec![ParamValue::Str("TOPO".into())],
        );
        let catalog_rx = self.call_system_procedure(
            &cxn,
            "@SystemCatalog",
            vec![ParamValue::Str("PROCEDURES".into())],
        );

        let inner = self.clone();
        let sub_cxn = cxn.clone();
        tokio::spawn(async move {
            inner.subscribe_completion(subscribe_rx.await.ok(), &sub_cxn);
        });
        let inner = self.clone();
        tokio::spawn(async move {
            inner.topo_stats_completion(topo_rx.await.ok());
        });
        let inner = self.clone();
        tokio::spawn(async move {
            inner.procedure_catalog_completion(catalog_rx.await.ok());
        });
    }

    fn subscribe_completion(self: &Arc<Self>, response: Option<ClientResponse>, cxn: &Arc<Connection>) {
        if !self.check_system_response(response.as_ref(), "@Subscribe", 0) {
            // Give up on this subscriber and retry after the failure
            // delay, unless teardown already re-armed things.
            let mut state = self.conn_state.lock().unwrap();
            if state
                .subscribed
                .as_ref()
                .map(|c| Arc::ptr_eq(c, cxn))
                .unwrap_or(false)
            {
                state.subscribed = None;
            }
            drop(state);
            self.ensure_subscription(RESUBSCRIPTION_FAILURE_DELAY);
        } else {
            debug!("subscribed to topology changes");
        }
    }

    // ========================================================================
    // Topology refresh
    // ========================================================================

    /// Refresh topology data only. Used when a new connection comes up:
    /// the cluster itself did not change, so no push will arrive.
    pub(crate) fn refresh_topology(self: &Arc<Self>, delay: Duration) {
        let has_connections = !self.connection_list.read().unwrap().is_empty();
        if self.is_shutdown() || !has_connections || self.subscription_pending.load(Ordering::SeqCst)
        {
            return;
        }
        if !self.topo_refresh_pending.swap(true, Ordering::SeqCst) {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.topology_refresh_task().await;
            });
        }
    }

    async fn topology_refresh_task(self: Arc<Self>) {
        if self.is_shutdown() {
            self.topo_refresh_pending.store(false, Ordering::SeqCst);
            return;
        }
        let cxn = {
            let subscribed = self.conn_state.lock().unwrap().subscribed.clone();
            subscribed.or_else(|| self.arbitrary_connection())
        };
        self.topo_refresh_pending.store(false, Ordering::SeqCst);
        let Some(cxn) = cxn else {
            return; // next connection-up event handles recovery
        };
        let rx = self.call_system_procedure(
            &cxn,
            "@Statistics",
            vec![ParamValue::Str("TOPO".into())],
        );
        self.topo_stats_completion(rx.await.ok());
    }

    /// Install new topology: hashinator, partition-leader map, and the
    /// set of hosts we should be connected to but are not.
    pub(crate) fn topo_stats_completion(self: &Arc<Self>, response: Option<ClientResponse>) {
        if !self.check_system_response(response.as_ref(), "@Statistics TOPO", 2) {
            return;
        }
        let response = response.expect("checked above");
        debug!("processing new topology data");

        // Force a partition-key reload on the next all-partition call.
        self.partition_keys_ts_ms.store(0, Ordering::SeqCst);

        let hash_config = &response.results()[1];
        match hash_config.get_varbinary(0, "HASHCONFIG") {
            Some(config) => match Hashinator::from_config(config) {
                Ok(hashinator) => {
                    *self.hashinator.write().unwrap() = Some(Arc::new(hashinator));
                }
                Err(e) => self.log_error(&format!("Cannot parse hashinator config: {e}")),
            },
            None => self.log_error("Topology statistics carried no HASHCONFIG"),
        }

        let partitions = &response.results()[0];
        let mut new_leaders = HashMap::with_capacity(partitions.row_count());
        let mut unconnected: HashSet<i32> = HashSet::new();
        for row in 0..partitions.row_count() {
            let Some(partition) = partitions.get_long(row, "Partition") else {
                continue;
            };
            if let Some(sites) = partitions.get_string(row, "Sites") {
                for site in sites.split(',') {
                    if let Some(host_id) = parse_host_id(site) {
                        if self.get_connection_for_host(host_id).is_none() {
                            unconnected.insert(host_id);
                        }
                    }
                }
            }
            if let Some(leader) = partitions.get_string(row, "Leader") {
                if let Some(leader_id) = parse_host_id(leader) {
                    if let Some(cxn) = self.get_connection_for_host(leader_id) {
                        new_leaders.insert(partition as i32, cxn);
                    }
                }
            }
        }
        *self.partition_leaders.write().unwrap() = Arc::new(new_leaders);

        if !unconnected.is_empty() {
            debug!(count = unconnected.len(), "hosts are not currently connected");
            self.schedule_connection_task(unconnected, Duration::ZERO);
        }
    }

    // ========================================================================
    // Procedure catalog
    // ========================================================================

    /// Install a new procedure map from `@SystemCatalog PROCEDURES`:
    /// name in column 2, a JSON document in column 6.
    pub(crate) fn procedure_catalog_completion(self: &Arc<Self>, response: Option<ClientResponse>) {
        if !self.check_system_response(response.as_ref(), "@SystemCatalog PROCEDURES", 1) {
            return;
        }
        let response = response.expect("checked above");
        debug!("processing new procedure catalogue");

        let table = &response.results()[0];
        let mut new_map = HashMap::with_capacity(table.row_count());
        let mut bad_json = 0u32;
        for row in 0..table.row_count() {
            let name = table.get_string_at(row, 2).unwrap_or("<unknown>");
            let doc = table.get_string_at(row, 6).unwrap_or("");
            match serde_json::from_str::<ProcJson>(doc) {
                Ok(parsed) => {
                    let info = if parsed.single_partition {
                        ProcInfo {
                            read_only: parsed.read_only,
                            partition_parameter: parsed.partition_parameter,
                            parameter_type: parsed
                                .partition_parameter_type
                                .and_then(ParamType::from_code),
                        }
                    } else {
                        ProcInfo {
                            read_only: parsed.read_only,
                            partition_parameter: None,
                            parameter_type: None,
                        }
                    };
                    new_map.insert(name.to_owned(), info);
                }
                Err(_) => {
                    bad_json += 1;
                    if bad_json <= MAX_BAD_JSON_LOGS {
                        self.log_error(&format!("Catalog parse error for procedure '{name}'"));
                    }
                }
            }
        }
        if bad_json > MAX_BAD_JSON_LOGS {
            warn!(bad_json, "further catalog parse errors suppressed");
        }
        *self.proc_info.write().unwrap() = Arc::new(new_map);
    }

    // ========================================================================
    // Connection tasks
    // ========================================================================

    /// Connect to hosts known from topology but not currently connected.
    /// Two stages: collect host addresses from any connected node, then
    /// do the connects on the background task, never on a read task.
    pub(crate) fn schedule_connection_task(self: &Arc<Self>, host_ids: HashSet<i32>, delay: Duration) {
        if !self.auto_connection_mgmt || self.is_shutdown() || host_ids.is_empty() {
            return;
        }
        if !self.connection_task_pending.swap(true, Ordering::SeqCst) {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.connection_task(host_ids).await;
            });
        }
    }

    async fn connection_task(self: Arc<Self>, host_ids: HashSet<i32>) {
        if self.is_shutdown() {
            self.connection_task_pending.store(false, Ordering::SeqCst);
            return;
        }
        // Stage 1: host overview from any connection.
        let Some(cxn) = self.arbitrary_connection() else {
            self.connection_task_pending.store(false, Ordering::SeqCst);
            return; // connections went down after we were queued
        };
        let rx = self.call_system_procedure(
            &cxn,
            "@SystemInformation",
            vec![ParamValue::Str("OVERVIEW".into())],
        );
        let response = rx.await.ok();
        if !self.check_system_response(response.as_ref(), "@SystemInformation OVERVIEW", 1) {
            self.connection_task_pending.store(false, Ordering::SeqCst);
            self.schedule_connection_task(host_ids, self.reconnect_retry_delay);
            return;
        }
        let response = response.expect("checked above");
        let info = &response.results()[0];

        // Stage 2: connect to each still-unconnected host.
        let mut retry = false;
        let addresses = self.unconnected_addresses(&host_ids, info);
        let mut remaining = host_ids;
        for (host_id, (host, port)) in addresses {
            match self.create_connection(&host, port).await {
                Ok(()) => {
                    remaining.remove(&host_id);
                }
                Err(e) => {
                    self.log_error(&format!(
                        "Failed to connect to host {host_id} at {host}:{port}: {e}"
                    ));
                    retry = true;
                }
            }
        }
        self.connection_task_pending.store(false, Ordering::SeqCst);
        if retry {
            self.schedule_connection_task(remaining, self.reconnect_retry_delay);
        }
    }

    /// Resolve host ids to addresses from an `OVERVIEW` table, skipping
    /// hosts that connected in the meantime.
    fn unconnected_addresses(
        &self,
        host_ids: &HashSet<i32>,
        info: &ResultTable,
    ) -> HashMap<i32, (String, u16)> {
        let port_key = self.port_key.get_or_init(|| self.sniff_port_key(info));
        let mut addr_map: HashMap<i32, String> = HashMap::new();
        let mut port_map: HashMap<i32, u16> = HashMap::new();
        for row in 0..info.row_count() {
            let (Some(key), Some(host_id)) =
                (info.get_string(row, "KEY"), info.get_long(row, "HOST_ID"))
            else {
                continue;
            };
            if key == "IPADDRESS" {
                if let Some(addr) = info.get_string(row, "VALUE") {
                    addr_map.insert(host_id as i32, addr.to_owned());
                }
            } else if key == port_key.as_str() {
                if let Some(port) = info.get_string(row, "VALUE").and_then(|v| v.parse().ok()) {
                    port_map.insert(host_id as i32, port);
                }
            }
        }
        let mut out = HashMap::new();
        for &host_id in host_ids {
            if self.get_connection_for_host(host_id).is_some() {
                continue;
            }
            match (addr_map.get(&host_id), port_map.get(&host_id)) {
                (Some(addr), Some(&port)) => {
                    out.insert(host_id, (addr.clone(), port));
                }
                _ => self.log_error(&format!(
                    "Cannot connect to host {host_id}, no address/port information found"
                )),
            }
        }
        out
    }

    /// Decide, once, which port column to use: the admin port if every
    /// existing connection already uses its admin port, else the client
    /// port.
    fn sniff_port_key(&self, info: &ResultTable) -> String {
        let mut admins = 0;
        let mut peons = 0;
        for row in 0..info.row_count() {
            if info.get_string(row, "KEY") != Some("ADMINPORT") {
                continue;
            }
            let (Some(host_id), Some(admin_port)) = (
                info.get_long(row, "HOST_ID"),
                info.get_string(row, "VALUE").and_then(|v| v.parse::<u16>().ok()),
            ) else {
                continue;
            };
            if let Some(cxn) = self.get_connection_for_host(host_id as i32) {
                if cxn.port == admin_port {
                    admins += 1;
                } else {
                    peons += 1;
                }
            }
        }
        if peons == 0 && admins != 0 {
            "ADMINPORT".to_owned()
        } else {
            "CLIENTPORT".to_owned()
        }
    }

    /// Recover from losing the last connection: retry the historical
    /// connect set until one succeeds, re-arming indefinitely.
    pub(crate) fn schedule_first_connection(
        self: &Arc<Self>,
        hosts: HashSet<(String, u16)>,
        delay: Duration,
    ) {
        if !self.auto_connection_mgmt || self.is_shutdown() || hosts.is_empty() {
            return;
        }
        if !self.connection_task_pending.swap(true, Ordering::SeqCst) {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.first_connection_task(hosts).await;
            });
        }
    }

    async fn first_connection_task(self: Arc<Self>, hosts: HashSet<(String, u16)>) {
        if self.is_shutdown() {
            self.connection_task_pending.store(false, Ordering::SeqCst);
            return;
        }
        let mut retry = true;
        for (host, port) in &hosts {
            match self.create_connection(host, *port).await {
                Ok(()) => {
                    retry = false;
                    break; // one is all we need
                }
                Err(e) => {
                    self.log_error(&format!("Failed to connect to host at {host}:{port}: {e}"));
                }
            }
        }
        self.connection_task_pending.store(false, Ordering::SeqCst);
        if retry {
            self.schedule_first_connection(hosts, self.reconnect_retry_delay);
        }
    }

    // ========================================================================
    // Partition-key cache
    // ========================================================================

    /// Get the partition-key cache up to date, refreshing it when stale.
    /// The returned receiver resolves when the cache is usable (or the
    /// refresh failed). A single refresh is in flight at a time; callers
    /// queue behind it.
    pub(crate) fn refresh_partition_keys(
        self: &Arc<Self>,
    ) -> tokio::sync::oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.is_shutdown() || self.connection_list.read().unwrap().is_empty() {
            let _ = tx.send(Err("no connection available".to_owned()));
            return rx;
        }
        let age_ms = now_epoch_ms() - self.partition_keys_ts_ms.load(Ordering::SeqCst);
        if Duration::from_millis(age_ms.max(0) as u64) > self.partition_keys_cache_refresh {
            self.partition_keys_waiters.lock().unwrap().push(tx);
            if !self.partition_keys_in_progress.swap(true, Ordering::SeqCst) {
                debug!("refreshing partition keys list");
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.partition_keys_task().await;
                });
            }
        } else {
            let _ = tx.send(Ok(()));
        }
        rx
    }

    async fn partition_keys_task(self: Arc<Self>) {
        let cxn = {
            let subscribed = self.conn_state.lock().unwrap().subscribed.clone();
            subscribed.or_else(|| self.arbitrary_connection())
        };
        let Some(cxn) = cxn else {
            self.notify_partition_keys_waiters(Err("no connection available".to_owned()));
            return;
        };
        let rx = self.call_system_procedure(
            &cxn,
            "@GetPartitionKeys",
            vec![ParamValue::Str("INTEGER".into())],
        );
        self.partition_keys_completion(rx.await.ok());
    }

    fn partition_keys_completion(self: &Arc<Self>, response: Option<ClientResponse>) {
        if !self.check_system_response(response.as_ref(), "@GetPartitionKeys INTEGER", 1) {
            self.notify_partition_keys_waiters(Err(
                "Partition keys cannot be determined".to_owned()
            ));
            return;
        }
        let response = response.expect("checked above");
        let table = &response.results()[0];
        let mut new_map = HashMap::with_capacity(table.row_count());
        for row in 0..table.row_count() {
            if let (Some(id), Some(key)) = (
                table.get_long(row, "PARTITION_ID"),
                table.get_long(row, "PARTITION_KEY"),
            ) {
                new_map.insert(id as i32, key as i32);
            }
        }
        self.partition_keys_ts_ms.store(now_epoch_ms(), Ordering::SeqCst);
        *self.partition_keys.write().unwrap() = Arc::new(new_map);
        self.notify_partition_keys_waiters(Ok(()));
    }

    fn notify_partition_keys_waiters(&self, result: Result<(), String>) {
        self.partition_keys_in_progress.store(false, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.partition_keys_waiters.lock().unwrap());
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Host ids in topology tables appear as "hostId:siteId" pairs.
fn parse_host_id(site: &str) -> Option<i32> {
    site.trim().split(':').next()?.trim().parse().ok()
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ids_parse_from_site_strings() {
        assert_eq!(parse_host_id("0:0"), Some(0));
        assert_eq!(parse_host_id(" 12:3 "), Some(12));
        assert_eq!(parse_host_id("7"), Some(7));
        assert_eq!(parse_host_id("x:1"), None);
        assert_eq!(parse_host_id(""), None);
    }

    #[test]
    fn proc_json_parses_catalog_documents() {
        let sp: ProcJson = serde_json::from_str(
            r#"{"readOnly":true,"singlePartition":true,"partitionParameter":0,"partitionParameterType":6}"#,
        )
        .unwrap();
        assert!(sp.read_only);
        assert!(sp.single_partition);
        assert_eq!(sp.partition_parameter, Some(0));
        assert_eq!(sp.partition_parameter_type, Some(6));

        let mp: ProcJson =
            serde_json::from_str(r#"{"readOnly":false,"singlePartition":false}"#).unwrap();
        assert!(!mp.single_partition);
        assert_eq!(mp.partition_parameter, None);

        assert!(serde_json::from_str::<ProcJson>("not json").is_err());
    }
}
