//! Pages the worker controls.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Whether this worker controls the client.
    pub controlled: bool,
}

impl Client {
    /// An uncontrolled page at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            controlled: false,
        }
    }
}

/// Clients registry.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Take control of every client in `scope`. Returns the IDs that changed
    /// controller.
    pub fn claim(&mut self, scope: &Url) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| !c.controlled && c.url.as_str().starts_with(scope.as_str()))
            .map(|c| {
                c.controlled = true;
                c.id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_claim_takes_in_scope_clients_once() {
        let mut clients = Clients::new();
        let inside = Client::window(url("https://albums.example/albums/1"));
        let outside = Client::window(url("https://other.example/"));
        let inside_id = inside.id.clone();
        clients.add(inside);
        clients.add(outside);

        let scope = url("https://albums.example/");
        assert_eq!(clients.claim(&scope), vec![inside_id.clone()]);
        assert!(clients.claim(&scope).is_empty());
        assert!(clients.get(&inside_id).unwrap().controlled);
    }

    #[test]
    fn test_remove_client() {
        let mut clients = Clients::new();
        let page = Client::window(url("https://albums.example/"));
        let id = page.id.clone();
        clients.add(page);
        assert_eq!(clients.len(), 1);

        assert!(clients.remove(&id).is_some());
        assert!(clients.remove(&id).is_none());
        assert!(clients.is_empty());
    }
}
