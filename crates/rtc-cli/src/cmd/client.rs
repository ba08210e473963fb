//! Commands that talk to a running `rtc serve`.

use crate::output::{print_json, print_table};
use anyhow::{anyhow, Context};
use rtc_core::config::Config;
use rtc_core::dispatch::{ATTEMPT_QUERY_PARAM, CALLBACK_EVENT_NAME};
use serde_json::Value;
use std::path::Path;

fn base_url(root: &Path, server: Option<&str>) -> anyhow::Result<String> {
    let url = match server {
        Some(s) => s.to_string(),
        None => {
            Config::load(root)
                .context("failed to load config")?
                .server
                .public_base_url
        }
    };
    Ok(url.trim_end_matches('/').to_string())
}

/// Turn a ureq result into the JSON body, surfacing the server's `error`
/// field on non-2xx answers.
fn into_json(result: Result<ureq::Response, ureq::Error>, url: &str) -> anyhow::Result<Value> {
    match result {
        Ok(resp) => {
            let text = resp.into_string()?;
            Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
        }
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(text);
            Err(anyhow!("server answered {code}: {message}"))
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("request to {url} failed"))),
    }
}

fn get(url: &str) -> anyhow::Result<Value> {
    into_json(ureq::get(url).call(), url)
}

fn post(url: &str, body: &str) -> anyhow::Result<Value> {
    into_json(
        ureq::post(url)
            .set("Content-Type", "text/plain")
            .send_string(body),
        url,
    )
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

pub fn start(root: &Path, server: Option<&str>, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/api/orchestrations", base_url(root, server)?);
    let body = post(&url, "")?;
    if json {
        print_json(&body)?;
    } else {
        println!("Started {}", body["id"].as_str().unwrap_or("?"));
        println!("  status:   {}", body["status_uri"].as_str().unwrap_or("?"));
        println!("  callback: {}", body["callback_uri"].as_str().unwrap_or("?"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

pub fn status(root: &Path, server: Option<&str>, id: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/api/orchestrations/{id}", base_url(root, server)?);
    let body = get(&url)?;
    if json {
        return print_json(&body);
    }

    println!("Instance: {id}");
    println!("State:    {}", body["overall_state"].as_str().unwrap_or(""));
    println!("Step:     {}", body["step"]["type"].as_str().unwrap_or("-"));
    if body["running"].as_bool() == Some(true) {
        println!("Running:  yes");
    }
    let c = &body["counters"];
    println!(
        "Counters: {} attempts, {} errors, {} timeouts, {} failed callbacks",
        c["attempts"], c["errors"], c["timeouts"], c["callback_failures"]
    );

    let rows: Vec<Vec<String>> = body["attempts"]
        .as_array()
        .map(|attempts| {
            attempts
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    vec![
                        (i + 1).to_string(),
                        a["state"].as_str().unwrap_or("").to_string(),
                        a["started_at"].as_str().unwrap_or("").to_string(),
                        a["message"].as_str().unwrap_or("").to_string(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    if !rows.is_empty() {
        println!();
        print_table(&["#", "STATE", "STARTED", "MESSAGE"], rows);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// callback
// ---------------------------------------------------------------------------

pub fn callback(
    root: &Path,
    server: Option<&str>,
    id: &str,
    outcome: &str,
    attempt: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let mut url = format!(
        "{}/api/orchestrations/{id}/events/{CALLBACK_EVENT_NAME}",
        base_url(root, server)?
    );
    if let Some(attempt) = attempt {
        url.push_str(&format!("?{ATTEMPT_QUERY_PARAM}={attempt}"));
    }
    let body = post(&url, outcome)?;
    if json {
        print_json(&body)?;
    } else if body["delivered"].as_bool() == Some(true) {
        println!("Callback delivered to {id}");
    } else if body["stale"].as_bool() == Some(true) {
        println!("Callback for {id} belongs to another attempt; ignored");
    } else {
        println!("No wait outstanding for {id}; callback ignored");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// reset / delete
// ---------------------------------------------------------------------------

pub fn reset(root: &Path, server: Option<&str>, id: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/api/orchestrations/{id}/reset", base_url(root, server)?);
    let body = post(&url, "")?;
    if json {
        print_json(&body)?;
    } else {
        println!("Reset {id}");
    }
    Ok(())
}

pub fn delete(root: &Path, server: Option<&str>, id: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/api/orchestrations/{id}", base_url(root, server)?);
    let body = into_json(ureq::delete(&url).call(), &url)?;
    if json {
        print_json(&body)?;
    } else {
        println!("Deleted {id}");
    }
    Ok(())
}
