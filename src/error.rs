use std::io;

use thiserror::Error;

use crate::{ForkId, PhilosopherId};

#[derive(Debug, Error)]
pub enum SimError {
    // 哲学者の人数が範囲外。リソースを確保する前に弾く
    #[error("number of philosophers must be within {min}..={max}, got {requested}")]
    InvalidConfiguration {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("simulation is already running")]
    AlreadyRunning,

    #[error("no simulation session")]
    NotRunning,

    // Naive 戦略で右のフォークを待ちきれなかった。哲学者の中で処理され、外には出ない
    #[error("philosopher {philosopher} timed out waiting for fork {fork}")]
    AcquisitionTimeout {
        philosopher: PhilosopherId,
        fork: ForkId,
    },

    // 所有者以外による解放。正しい戦略では起こり得ない
    #[error("philosopher {holder} released fork {fork} owned by {owner:?}")]
    OwnershipViolation {
        fork: ForkId,
        holder: PhilosopherId,
        owner: Option<PhilosopherId>,
    },

    #[error("failed to spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
