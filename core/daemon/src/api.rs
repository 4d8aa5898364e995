//! Outbound HTTP calls: coordinator registration and local daemon stop.

use relay_daemon_protocol::machine::{MachineRecord, RegisterMachineRequest, RegisterMachineResponse};
use relay_daemon_protocol::{StatusResponse, CONTROL_HOST, ROUTE_STOP};
use std::time::Duration;
use url::Url;

use crate::config::ServerConfig;

const USER_AGENT: &str = concat!("relay-daemon/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

fn client(timeout: Duration) -> Result<reqwest::Client, ApiError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

fn machines_url(server_url: &Url) -> Url {
    let mut url = server_url.clone();
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/v1/machines", base));
    url.set_query(None);
    url
}

/// `POST <server>/v1/machines`. Creates the machine or returns the existing
/// record with its current versions.
pub async fn register_machine(
    server: &ServerConfig,
    request: &RegisterMachineRequest,
    timeout: Duration,
) -> Result<MachineRecord, ApiError> {
    let url = machines_url(&server.url);
    let response = client(timeout)?
        .post(url.clone())
        .bearer_auth(&server.token)
        .json(request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            url: url.to_string(),
            status,
            body,
        });
    }
    let body: RegisterMachineResponse = response.json().await?;
    Ok(body.machine)
}

/// Asks the daemon listening on `port` to stop.
pub async fn request_local_stop(port: u16, timeout: Duration) -> Result<StatusResponse, ApiError> {
    let url = format!("http://{}:{}{}", CONTROL_HOST, port, ROUTE_STOP);
    let response = client(timeout)?.post(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status {
            url,
            status,
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response.json().await?)
}
