//! Scripted network for tests and offline simulation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use albumkit_net::{NetError, NetworkClient, Request, Response};
use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;

#[derive(Debug, Clone)]
enum Reply {
    Respond(Response),
    Fail,
}

#[derive(Debug, Default)]
struct Route {
    once: VecDeque<Reply>,
    always: Option<Reply>,
}

/// A [`NetworkClient`] answering from a per-URL script.
///
/// One-shot replies are consumed first, then the standing reply applies.
/// Unscripted URLs and an offline network fail with
/// [`NetError::Unreachable`].
#[derive(Debug, Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<(Method, String)>>,
    offline: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `url` with `response`.
    pub fn respond(&self, url: &str, response: Response) {
        lock(&self.routes).entry(url.to_string()).or_default().always =
            Some(Reply::Respond(response));
    }

    /// Answer the next request for `url` with `response`.
    pub fn respond_once(&self, url: &str, response: Response) {
        lock(&self.routes)
            .entry(url.to_string())
            .or_default()
            .once
            .push_back(Reply::Respond(response));
    }

    /// Always fail requests for `url`.
    pub fn fail(&self, url: &str) {
        lock(&self.routes).entry(url.to_string()).or_default().always = Some(Reply::Fail);
    }

    /// Fail the next request for `url`.
    pub fn fail_once(&self, url: &str) {
        lock(&self.routes)
            .entry(url.to_string())
            .or_default()
            .once
            .push_back(Reply::Fail);
    }

    /// Fail every request while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every request seen, in order.
    pub fn calls(&self) -> Vec<(Method, String)> {
        lock(&self.calls).clone()
    }

    /// Number of requests seen for `url`.
    pub fn call_count(&self, url: &str) -> usize {
        lock(&self.calls).iter().filter(|(_, u)| u == url).count()
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        lock(&self.calls).push((request.method.clone(), url.clone()));

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Unreachable(url));
        }

        let reply = {
            let mut routes = lock(&self.routes);
            routes
                .get_mut(&url)
                .and_then(|route| route.once.pop_front().or_else(|| route.always.clone()))
        };

        match reply {
            Some(Reply::Respond(response)) => Ok(response.with_url(request.url.clone())),
            Some(Reply::Fail) | None => Err(NetError::Unreachable(url)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_once_then_standing_reply() {
        let network = MockNetwork::new();
        let url = "https://api.example/x";
        network.respond_once(url, Response::new(200, "first"));
        network.fail(url);

        let request = Request::get_str(url).unwrap();
        assert_eq!(&network.fetch(&request).await.unwrap().body[..], b"first");
        assert!(network.fetch(&request).await.is_err());
        assert_eq!(network.call_count(url), 2);
    }

    #[tokio::test]
    async fn test_offline_overrides_script() {
        let network = MockNetwork::new();
        let url = "https://api.example/x";
        network.respond(url, Response::new(200, "ok"));
        network.set_offline(true);

        let request = Request::get_str(url).unwrap();
        assert!(matches!(
            network.fetch(&request).await,
            Err(NetError::Unreachable(_))
        ));
        network.set_offline(false);
        assert!(network.fetch(&request).await.is_ok());
    }
}
