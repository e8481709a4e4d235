use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::{sleep, Duration};

use agentdash::api::{ApiClient, CredentialStore};
use agentdash::cache::{CacheEntry, FetchStatus, ResourceCache};
use agentdash::config::Config;
use agentdash::dashboard::{Dashboard, HealthStatus, Lead};
use agentdash::leads::{page_leads, LeadQuery};
use agentdash::logging::{log, obj, v_num, v_str, Domain, Level};
use agentdash::metrics::DashboardMetrics;
use agentdash::sync::Synchronizer;

fn entry_fields(entry: &CacheEntry) -> Vec<(&'static str, serde_json::Value)> {
    let mut fields = vec![
        ("key", v_str(&entry.key.to_string())),
        ("status", v_str(entry.status.as_str())),
    ];
    if let Some(err) = &entry.error {
        fields.push(("code", v_str(err.error_code())));
        fields.push(("error", v_str(err.message())));
    }
    fields
}

fn on_health(entry: &CacheEntry) {
    let mut fields = entry_fields(entry);
    if let Some(Ok(h)) = entry.decode::<HealthStatus>() {
        fields.push(("all_healthy", json!(h.all_healthy())));
    }
    log(Level::Info, Domain::System, "health", obj(&fields));
}

fn on_metrics(entry: &CacheEntry) {
    let mut fields = entry_fields(entry);
    if entry.status == FetchStatus::Success {
        let m = DashboardMetrics::from_entry(entry);
        fields.push(("messages_received", v_num(m.messages_received)));
        fields.push(("tasks_dispatched", v_num(m.tasks_dispatched)));
        fields.push(("leads_saved", v_num(m.leads_saved)));
        fields.push(("tool_calls", v_num(m.tool_calls)));
    }
    log(Level::Info, Domain::System, "metrics", obj(&fields));
}

fn on_leads(entry: &CacheEntry, page_size: usize) {
    let mut fields = entry_fields(entry);
    if let Some(Ok(leads)) = entry.decode::<Vec<Lead>>() {
        let page = page_leads(&leads, &LeadQuery { page_size, ..Default::default() });
        fields.push(("total", json!(page.total)));
        fields.push(("pages", json!(page.total_pages)));
        if let Some(newest) = page.items.first() {
            fields.push(("newest", v_str(&newest.company_name)));
        }
    }
    log(Level::Info, Domain::System, "leads", obj(&fields));
}

fn on_entry(entry: &CacheEntry) {
    log(Level::Info, Domain::System, "entry", obj(&entry_fields(entry)));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    let credentials = Arc::new(match &cfg.token_file {
        Some(path) => CredentialStore::with_file(path)?,
        None => CredentialStore::new(),
    });
    if let Some(token) = &cfg.api_token {
        credentials.set(token)?;
    }
    let api = ApiClient::new(&cfg, credentials.clone())?;

    if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
        if !credentials.is_authenticated() {
            api.login(user, password).await.context("login failed")?;
        }
    }

    log(
        Level::Info,
        Domain::System,
        "start",
        obj(&[
            ("api_base", v_str(&cfg.api_base)),
            ("authenticated", json!(credentials.is_authenticated())),
            ("health_poll_secs", json!(cfg.health_poll_secs)),
            ("metrics_poll_secs", json!(cfg.metrics_poll_secs)),
        ]),
    );

    let sync = Synchronizer::new(ResourceCache::new());
    let dash = Dashboard::new(cfg.clone(), api, sync.clone());

    let page_size = cfg.leads_page_size;
    let _health = sync.subscribe(dash.health(), on_health);
    let _metrics = sync.subscribe(dash.metrics(), on_metrics);
    let _leads = sync.subscribe(dash.leads(), move |e: &CacheEntry| on_leads(e, page_size));
    let _conversations = sync.subscribe(dash.conversations(), on_entry);

    let deadline = async {
        if cfg.run_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            sleep(Duration::from_secs(cfg.run_secs)).await;
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
        _ = deadline => {}
    }

    sync.shutdown();
    log(
        Level::Info,
        Domain::System,
        "stop",
        obj(&[("fetches_issued", json!(sync.fetches_issued()))]),
    );
    Ok(())
}
