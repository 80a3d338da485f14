use crate::domain::{AdapterFactory, RegistryAdapter, Service};
use crate::services::AdapterFactories;
use anyhow::{Context, Result, bail};
use flume::{Receiver, RecvTimeoutError, Sender};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use url::Url;

const API_BASE: &str = "https://api.telegram.org";
const QUEUE_DEPTH: usize = 100;
const FIRST_FLUSH: Duration = Duration::from_secs(5);
const FLUSH_EVERY: Duration = Duration::from_secs(1);

pub fn register(factories: &mut AdapterFactories) {
    factories.register("telegram", Arc::new(TelegramFactory));
}

/// Builds a notifier from `telegram://<chat-id>` and `TELEGRAM_BOT_TOKEN`.
pub struct TelegramFactory;

impl AdapterFactory for TelegramFactory {
    fn build(&self, uri: &Url) -> Result<Box<dyn RegistryAdapter>> {
        let token = env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if token.is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is not set");
        }
        let chat_id = parse_chat_id(uri)?;
        let base = Url::parse(API_BASE).context("parsing telegram api base")?;

        Ok(Box::new(TelegramNotifier::start(BotApi::new(base, &token, chat_id)?)))
    }
}

fn parse_chat_id(uri: &Url) -> Result<i64> {
    let host = uri.host_str().unwrap_or_default();
    host.parse()
        .with_context(|| format!("invalid telegram chat id {host:?}"))
}

/// Thin client for the two Bot API methods the notifier needs.
#[derive(Debug, Clone)]
struct BotApi {
    http: Client,
    base: Url,
    token: String,
    chat_id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl BotApi {
    fn new(base: Url, token: &str, chat_id: i64) -> Result<Self> {
        if base.cannot_be_a_base() {
            bail!("telegram api base {base} cannot carry a path");
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            http,
            base,
            token: token.to_string(),
            chat_id,
        })
    }

    /// `<base>/bot<token>/<method>`. Tokens contain a colon, so the path is
    /// built by segment rather than joined as a relative reference.
    fn method_url(&self, method: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&format!("bot{}", self.token))
                .push(method);
        }
        url
    }

    fn call(&self, request: reqwest::blocking::RequestBuilder, method: &str) -> Result<()> {
        let response: ApiResponse = request
            .send()
            .with_context(|| format!("calling telegram {method}"))?
            .json()
            .with_context(|| format!("decoding telegram {method} response"))?;
        if !response.ok {
            bail!(
                "telegram {method} failed: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    fn get_me(&self) -> Result<()> {
        self.call(self.http.get(self.method_url("getMe")), "getMe")
    }

    fn send_message(&self, text: &str) -> Result<()> {
        let url = self.method_url("sendMessage");
        let body = SendMessage {
            chat_id: self.chat_id,
            text,
        };
        self.call(self.http.post(url).json(&body), "sendMessage")
    }
}

/// Posts online/offline notices to a Telegram chat instead of maintaining a
/// directory. Messages are batched by a background worker.
#[derive(Debug)]
pub struct TelegramNotifier {
    api: BotApi,
    queue: Sender<String>,
    /// Service name → id of what has been announced online.
    announced: Mutex<HashMap<String, String>>,
}

impl TelegramNotifier {
    fn start(api: BotApi) -> Self {
        let (queue, rx) = flume::bounded(QUEUE_DEPTH);
        let worker_api = api.clone();
        let spawned = thread::Builder::new()
            .name("telegram-batcher".into())
            .spawn(move || flush_batches(&worker_api, &rx));
        if let Err(e) = spawned {
            error!(error = %e, "failed to start telegram worker");
        }

        Self {
            api,
            queue,
            announced: Mutex::new(HashMap::new()),
        }
    }

    fn enqueue(&self, message: String) {
        if self.queue.send(message).is_err() {
            warn!("telegram worker is gone, dropping message");
        }
    }

    fn announced(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.announced.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryAdapter for TelegramNotifier {
    fn ping(&self) -> Result<()> {
        self.api.get_me()?;
        debug!("telegram bot reachable");
        Ok(())
    }

    fn register(&self, service: &Service) -> Result<()> {
        self.enqueue(format!(
            "ONLINE: Service {} with ip {} goes online",
            service.name, service.ip
        ));
        self.announced()
            .insert(service.name.clone(), service.id.clone());
        Ok(())
    }

    fn deregister(&self, service: &Service) -> Result<()> {
        if self.announced().remove(&service.name).is_some() {
            self.enqueue(format!(
                "OFFLINE: Service {} with ip {} goes offline",
                service.name, service.ip
            ));
        }
        Ok(())
    }

    fn refresh(&self, _service: &Service) -> Result<()> {
        Ok(())
    }

    fn services(&self) -> Result<Vec<Service>> {
        Ok(self
            .announced()
            .iter()
            .map(|(name, id)| Service::remote(id.clone(), name.clone()))
            .collect())
    }
}

/// Collects queued messages and sends them as one text, first after
/// `FIRST_FLUSH` and then every `FLUSH_EVERY`. Exits once the notifier is
/// dropped, flushing what is left.
fn flush_batches(api: &BotApi, rx: &Receiver<String>) {
    let mut pending: Vec<String> = Vec::new();
    let mut deadline = Instant::now() + FIRST_FLUSH;

    loop {
        match rx.recv_deadline(deadline) {
            Ok(message) => pending.push(message),
            Err(RecvTimeoutError::Timeout) => {
                send_batch(api, &mut pending);
                deadline = Instant::now() + FLUSH_EVERY;
            }
            Err(RecvTimeoutError::Disconnected) => {
                send_batch(api, &mut pending);
                return;
            }
        }
    }
}

fn send_batch(api: &BotApi, pending: &mut Vec<String>) {
    if pending.is_empty() {
        return;
    }
    let text = batch_text(pending);
    pending.clear();
    if let Err(e) = api.send_message(&text) {
        error!(error = %e, "could not send message to telegram");
    }
}

fn batch_text(messages: &[String]) -> String {
    messages.iter().map(|m| format!("{m}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> TelegramNotifier {
        // Port 9 (discard) keeps any stray send local and failing fast.
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        TelegramNotifier::start(BotApi::new(base, "token", 42).unwrap())
    }

    fn service(id: &str, name: &str) -> Service {
        Service {
            ip: "10.0.0.1".into(),
            ..Service::remote(id, name)
        }
    }

    #[test]
    fn test_chat_id_from_host() {
        assert_eq!(parse_chat_id(&Url::parse("telegram://12345").unwrap()).unwrap(), 12345);
        assert!(parse_chat_id(&Url::parse("telegram://chat").unwrap()).is_err());
    }

    #[test]
    fn test_method_url_embeds_token() {
        let api = BotApi::new(Url::parse(API_BASE).unwrap(), "abc:def", 1).unwrap();

        assert_eq!(
            api.method_url("getMe").as_str(),
            "https://api.telegram.org/botabc:def/getMe"
        );
    }

    #[test]
    fn test_batch_text_joins_lines() {
        let text = batch_text(&["ONLINE: a".to_string(), "OFFLINE: b".to_string()]);

        assert_eq!(text, "ONLINE: a\nOFFLINE: b\n");
    }

    #[test]
    fn test_tracks_announced_services() {
        let notifier = notifier();
        notifier.register(&service("h:web:80", "web")).unwrap();
        notifier.register(&service("h:db:5432", "db")).unwrap();

        let mut ids: Vec<String> = notifier.services().unwrap().into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["h:db:5432", "h:web:80"]);

        notifier.deregister(&service("h:web:80", "web")).unwrap();
        notifier.deregister(&service("h:web:80", "web")).unwrap();

        let names: Vec<String> = notifier.services().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["db"]);
    }

    #[test]
    fn test_missing_token_is_error() {
        if env::var("TELEGRAM_BOT_TOKEN").is_ok() {
            return;
        }

        let result = TelegramFactory.build(&Url::parse("telegram://42").unwrap());

        assert!(result.is_err());
    }
}
