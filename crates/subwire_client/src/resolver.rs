#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use subwire_domain::ApiError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::EventSubApi;
use crate::manager::Msg;

/// Pause before re-requesting a login whose lookup failed at the transport level.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Login → user id resolution with a run-lifetime cache.
///
/// At most one API request per login is in flight at a time; completions
/// arrive through the manager mailbox as [`Msg::IdResolved`]. Mappings are
/// monotonic: once a login resolves, the id is never rewritten.
pub(crate) struct IdResolver {
	api: Arc<dyn EventSubApi>,
	events: mpsc::Sender<Msg>,
	login_to_id: HashMap<String, String>,
	id_to_login: HashMap<String, String>,
	/// Logins the API reported as nonexistent. They stay unresolved; a later
	/// request may still be issued in case the name comes into existence.
	not_found: HashSet<String>,
	in_flight: HashSet<String>,
}

impl IdResolver {
	pub(crate) fn new(api: Arc<dyn EventSubApi>, events: mpsc::Sender<Msg>) -> Self {
		Self {
			api,
			events,
			login_to_id: HashMap::new(),
			id_to_login: HashMap::new(),
			not_found: HashSet::new(),
			in_flight: HashSet::new(),
		}
	}

	/// Non-blocking cache lookup.
	pub(crate) fn lookup(&self, login: &str) -> Option<&str> {
		self.login_to_id.get(&login.to_ascii_lowercase()).map(String::as_str)
	}

	/// Whether the API reported this login as nonexistent.
	pub(crate) fn is_not_found(&self, login: &str) -> bool {
		self.not_found.contains(&login.to_ascii_lowercase())
	}

	/// Ensure a resolution request is outstanding for this login.
	///
	/// Already-cached and already-in-flight logins are left alone, so any
	/// number of concurrent interests share one API call.
	pub(crate) fn request(&mut self, login: &str) {
		let login = login.trim().to_ascii_lowercase();
		if login.is_empty() || self.login_to_id.contains_key(&login) || self.in_flight.contains(&login) {
			return;
		}
		self.in_flight.insert(login.clone());

		let api = Arc::clone(&self.api);
		let events = self.events.clone();
		tokio::spawn(async move {
			let result = api.user_id_for_login(&login).await;
			let _ = events.send(Msg::IdResolved { login, result }).await;
		});
	}

	/// Record a completed lookup. Returns true when a new id became known and
	/// pending subscriptions are worth re-checking.
	pub(crate) fn complete(&mut self, login: &str, result: Result<Option<String>, ApiError>) -> bool {
		self.in_flight.remove(login);

		match result {
			Ok(Some(id)) => {
				self.not_found.remove(login);

				if let Some(existing) = self.login_to_id.get(login) {
					if existing != &id {
						warn!(login, existing = %existing, id = %id, "ignoring conflicting id for already-resolved login");
					}
					return false;
				}
				if let Some(existing_login) = self.id_to_login.get(&id)
					&& existing_login != login
				{
					warn!(login, id = %id, existing = %existing_login, "ignoring id already mapped to another login");
					return false;
				}

				debug!(login, id = %id, "resolved login");
				self.login_to_id.insert(login.to_string(), id.clone());
				self.id_to_login.insert(id, login.to_string());
				true
			}
			Ok(None) => {
				debug!(login, "login does not exist; topics stay pending");
				self.not_found.insert(login.to_string());
				false
			}
			Err(e) => {
				warn!(login, error = %e, "id lookup failed; retrying later");
				let events = self.events.clone();
				let login = login.to_string();
				tokio::spawn(async move {
					tokio::time::sleep(RETRY_DELAY).await;
					let _ = events.send(Msg::RequestId { login }).await;
				});
				false
			}
		}
	}
}
