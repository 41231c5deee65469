//! Every domain store of the host, and the in-memory snapshot they fill.

use store::domain::{
    CooldownAdapter, CooldownTable, GameStatsAdapter, IdentityAdapter, IdentityRegistry,
    PaymentAdapter, PaymentLedger, PlayStatistics, ReputationAdapter, ReputationBook,
    StatisticsAdapter,
};
use store::{Backend, DualModeStore, PersistenceError, StoreHandle};
use tracing::{debug, info};

pub struct Stores {
    pub identities: DualModeStore<IdentityAdapter>,
    pub reputation: DualModeStore<ReputationAdapter>,
    pub statistics: DualModeStore<StatisticsAdapter>,
    /// Written through `update` only, so it has no place in [`Snapshot`].
    pub game_stats: DualModeStore<GameStatsAdapter>,
    pub cooldowns: DualModeStore<CooldownAdapter>,
    pub payments: DualModeStore<PaymentAdapter>,
}

/// State the host keeps in memory between saves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub identities: IdentityRegistry,
    pub reputation: ReputationBook,
    pub statistics: PlayStatistics,
    pub cooldowns: CooldownTable,
    pub payments: PaymentLedger,
}

/// Result of one save pass, per store.
#[derive(Debug)]
pub struct SaveSummary {
    pub outcomes: Vec<(&'static str, Result<Backend, PersistenceError>)>,
}

impl SaveSummary {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_err()).count()
    }
}

impl Stores {
    pub fn new(handle: StoreHandle) -> Self {
        Self {
            identities: DualModeStore::new(IdentityAdapter, handle.clone()),
            reputation: DualModeStore::new(ReputationAdapter, handle.clone()),
            statistics: DualModeStore::new(StatisticsAdapter, handle.clone()),
            game_stats: DualModeStore::new(GameStatsAdapter, handle.clone()),
            cooldowns: DualModeStore::new(CooldownAdapter, handle.clone()),
            payments: DualModeStore::new(PaymentAdapter, handle),
        }
    }

    pub fn load(&self) -> Snapshot {
        let snapshot = Snapshot {
            identities: self.identities.load(),
            reputation: self.reputation.load(),
            statistics: self.statistics.load(),
            cooldowns: self.cooldowns.load(),
            payments: self.payments.load(),
        };
        info!(
            identities = snapshot.identities.len(),
            reputation = snapshot.reputation.len(),
            joins = snapshot.statistics.joins().len(),
            cooldowns = snapshot.cooldowns.len(),
            payments = snapshot.payments.len(),
            "Loaded state"
        );
        snapshot
    }

    /// Save every store. One store failing does not stop the others.
    pub fn save(&self, snapshot: &Snapshot) -> SaveSummary {
        let outcomes = vec![
            ("identities", self.identities.save(&snapshot.identities)),
            ("reputation", self.reputation.save(&snapshot.reputation)),
            ("statistics", self.statistics.save(&snapshot.statistics)),
            ("cooldowns", self.cooldowns.save(&snapshot.cooldowns)),
            ("payments", self.payments.save(&snapshot.payments)),
        ];
        let summary = SaveSummary { outcomes };
        debug!(failed = summary.failed(), "Save pass finished");
        summary
    }
}
