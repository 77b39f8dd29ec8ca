// Delivery of the finished report to a chat channel.
//
// Slack is the only real target.  The session checks the token with `auth.test` when it is
// created, so bad credentials surface before any chart is drawn.  A file is posted in three steps:
// ask for an upload URL, send the bytes there, then complete the upload into the channel with the
// caption as the message text.  Nothing is retried.

use crate::configs::SlackConfig;

use anyhow::Result;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use usagelog::UsageError;

const SLACK_API: &str = "https://slack.com/api";

pub trait Notifier {
    /// Post one message with `caption` as its text and the file at `path` attached.
    fn post_file(&self, caption: &str, path: &Path) -> Result<()>;
}

// The subset of Slack's response envelope that we look at.
#[derive(Debug, Default, Deserialize)]
struct SlackResponse {
    ok: bool,
    error: Option<String>,
    user_id: Option<String>,
    upload_url: Option<String>,
    file_id: Option<String>,
}

// Map `ok: false` to an error built by `fail`.
fn check(
    method: &str,
    response: SlackResponse,
    fail: fn(String) -> UsageError,
) -> usagelog::Result<SlackResponse> {
    if response.ok {
        Ok(response)
    } else {
        let reason = response.error.as_deref().unwrap_or("unknown error");
        Err(fail(format!("{method}: {reason}")))
    }
}

#[derive(Debug)]
pub struct SlackSession {
    client: Client,
    config: SlackConfig,
}

impl SlackSession {
    /// Authenticate.  Fails with Auth if the token is rejected.

    pub fn connect(config: SlackConfig) -> Result<SlackSession> {
        let client = Client::new();
        let response = client
            .post(format!("{SLACK_API}/auth.test"))
            .bearer_auth(&config.token)
            .send()
            .map_err(|e| UsageError::Auth(format!("auth.test: {e}")))?
            .json::<SlackResponse>()
            .map_err(|e| UsageError::Auth(format!("auth.test: {e}")))?;
        let response = check("auth.test", response, UsageError::Auth)?;
        tracing::info!(
            "Authenticated to Slack as {}",
            response.user_id.as_deref().unwrap_or("?")
        );
        Ok(SlackSession { client, config })
    }

    fn call(&self, method: &str, request: reqwest::blocking::RequestBuilder) -> Result<SlackResponse> {
        let response = request
            .bearer_auth(&self.config.token)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| UsageError::Delivery(format!("{method}: {e}")))?
            .json::<SlackResponse>()
            .map_err(|e| UsageError::Delivery(format!("{method}: {e}")))?;
        Ok(check(method, response, UsageError::Delivery)?)
    }
}

impl Notifier for SlackSession {
    fn post_file(&self, caption: &str, path: &Path) -> Result<()> {
        let bytes = fs::read(path).map_err(|e| UsageError::io(path, e))?;
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "report.jpg".to_string());

        let method = "files.getUploadURLExternal";
        let ticket = self.call(
            method,
            self.client
                .post(format!("{SLACK_API}/{method}"))
                .form(&[("filename", filename.clone()), ("length", bytes.len().to_string())]),
        )?;
        let (Some(upload_url), Some(file_id)) = (ticket.upload_url, ticket.file_id) else {
            return Err(UsageError::Delivery(format!("{method}: no upload URL in response")).into());
        };

        self.client
            .post(&upload_url)
            .body(bytes)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| UsageError::Delivery(format!("upload of {filename}: {e}")))?;

        let method = "files.completeUploadExternal";
        self.call(
            method,
            self.client
                .post(format!("{SLACK_API}/{method}"))
                .json(&complete_upload_body(&file_id, &filename, &self.config.channel, caption)),
        )?;
        tracing::info!("Posted {:?} to channel {}", path, self.config.channel);
        Ok(())
    }
}

fn complete_upload_body(file_id: &str, title: &str, channel: &str, caption: &str) -> serde_json::Value {
    serde_json::json!({
        "files": [{ "id": file_id, "title": title }],
        "channel_id": channel,
        "initial_comment": caption,
    })
}

#[test]
fn test_check() {
    let ok = SlackResponse {
        ok: true,
        user_id: Some("U1".to_string()),
        ..Default::default()
    };
    assert!(check("auth.test", ok, UsageError::Auth).unwrap().user_id.as_deref() == Some("U1"));

    let bad = SlackResponse {
        ok: false,
        error: Some("invalid_auth".to_string()),
        ..Default::default()
    };
    match check("auth.test", bad, UsageError::Auth) {
        Err(UsageError::Auth(msg)) => assert!(msg == "auth.test: invalid_auth"),
        _ => panic!("expected an auth error"),
    }

    let bad = SlackResponse::default();
    assert!(matches!(
        check("files.completeUploadExternal", bad, UsageError::Delivery),
        Err(UsageError::Delivery(_))
    ));
}

#[test]
fn test_decode_response() {
    let r: SlackResponse = serde_json::from_str(
        r#"{"ok":true,"upload_url":"https://files.slack.com/upload/v1/abc","file_id":"F123","warning":"x"}"#,
    )
    .unwrap();
    assert!(r.ok);
    assert!(r.file_id.as_deref() == Some("F123"));
    assert!(r.error.is_none());
}

#[test]
fn test_complete_upload_body() {
    let body = complete_upload_body("F123", "combined_image.jpg", "C42", "Resource Report");
    assert!(body["files"][0]["id"] == "F123");
    assert!(body["channel_id"] == "C42");
    assert!(body["initial_comment"] == "Resource Report");
}
