use rand::Rng;

/// Client and short identifiers of a new credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialIdentity {
    /// UUIDv4
    pub client_id: String,
    /// 16 lowercase hex characters (8 random bytes)
    pub short_id: String,
}

/// Source of fresh credential identifiers
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> CredentialIdentity;
}

/// Random identifiers from the thread-local RNG
///
/// Short ids are not checked for collisions here; the ledger's unique
/// constraint is the only guard.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentity;

impl IdentityGenerator for RandomIdentity {
    fn generate(&self) -> CredentialIdentity {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        CredentialIdentity {
            client_id: uuid::Uuid::new_v4().to_string(),
            short_id: hex::encode(bytes),
        }
    }
}

/// Replays a fixed list of identities, then repeats the last one
#[cfg(test)]
pub struct FixedIdentity {
    queue: std::sync::Mutex<std::collections::VecDeque<CredentialIdentity>>,
    last: std::sync::Mutex<Option<CredentialIdentity>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl FixedIdentity {
    pub fn new(short_ids: &[&str]) -> Self {
        let queue = short_ids
            .iter()
            .map(|sid| CredentialIdentity {
                client_id: uuid::Uuid::new_v4().to_string(),
                short_id: sid.to_string(),
            })
            .collect();
        Self {
            queue: std::sync::Mutex::new(queue),
            last: std::sync::Mutex::new(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl IdentityGenerator for FixedIdentity {
    fn generate(&self) -> CredentialIdentity {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            *last = Some(next);
        }
        last.clone().unwrap()
    }
}
