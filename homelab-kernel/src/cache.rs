/**
 * CACHES - tables détenues par chaque sous-serveur
 *
 * FONCTIONNEMENT :
 * - ResolveCache : vide -> rempli au premier get(), rempli -> vide sur invalidate(), jamais d'expiration seule
 * - TtlCache : garde l'horodatage de remplissage, une entrée trop vieille compte comme absente
 * - Les deux remplacent un Arc entier : un lecteur ne voit jamais une table à moitié construite
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::state::{empty_slot, Slot};

type Resolver<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct ResolveCache<T> {
    slot: Slot<T>,
    resolver: Resolver<T>,
    resolutions: AtomicU64,
}

impl<T> ResolveCache<T> {
    pub fn new(resolver: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self { slot: empty_slot(), resolver: Box::new(resolver), resolutions: AtomicU64::new(0) }
    }

    /// Valeur en cache, ou résolution synchrone puis stockage.
    /// Deux appels concurrents sur un cache vide peuvent résoudre tous les deux ;
    /// la résolution est idempotente, le dernier écrit gagne.
    pub fn get(&self) -> Arc<T> {
        if let Some(value) = self.slot.read().as_ref() {
            return Arc::clone(value);
        }
        let fresh = Arc::new((self.resolver)());
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        *self.slot.write() = Some(Arc::clone(&fresh));
        fresh
    }

    /// Vide le cache sans le repeupler.
    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }

    pub fn is_populated(&self) -> bool {
        self.slot.read().is_some()
    }

    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }
}

struct Stamped<T> {
    populated_at: OffsetDateTime,
    value: Arc<T>,
}

pub struct TtlCache<T> {
    slot: Slot<Stamped<T>>,
    ttl: Duration,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { slot: empty_slot(), ttl }
    }

    /// `None` si vide ou si `now - populated_at > ttl`.
    pub fn get_at(&self, now: OffsetDateTime) -> Option<Arc<T>> {
        let guard = self.slot.read();
        let stamped = guard.as_ref()?;
        if now - stamped.populated_at > self.ttl {
            return None;
        }
        Some(Arc::clone(&stamped.value))
    }

    pub fn put_at(&self, now: OffsetDateTime, value: T) -> Arc<T> {
        let value = Arc::new(value);
        *self.slot.write() = Some(Arc::new(Stamped { populated_at: now, value: Arc::clone(&value) }));
        value
    }

    pub fn age_at(&self, now: OffsetDateTime) -> Option<Duration> {
        self.slot.read().as_ref().map(|s| now - s.populated_at)
    }

    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }

    pub fn is_populated(&self) -> bool {
        self.slot.read().is_some()
    }
}
