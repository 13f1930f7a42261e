//! 游戏统计计数服务
//!
//! 游玩次数只增不减；评分以运行均值 `(avg * n + r) / (n + 1)` 累积。
//! 两种操作都不带幂等键，调用方重复调用会重复计数。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};

use crate::audit::{self, AuditAction, AuditEvent, AuditSink};
use crate::error::{MutationError, Result};
use crate::models::{GameStats, MAX_RATING, MIN_RATING, ResourceKey};
use crate::mutator::{ConcurrentMutator, Mutation};
use crate::store::{StoreTx, TxStore};

pub struct CounterService<S: TxStore> {
    mutator: Arc<ConcurrentMutator<S>>,
    audit: Arc<dyn AuditSink>,
}

impl<S: TxStore> CounterService<S> {
    pub fn new(mutator: Arc<ConcurrentMutator<S>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { mutator, audit }
    }

    /// 增加游玩次数，delta 必须为正
    #[instrument(skip(self))]
    pub async fn increment_play_count(&self, game_id: i64, delta: i64) -> Result<GameStats> {
        if delta <= 0 {
            return Err(MutationError::Validation(format!(
                "delta must be positive, got {delta}"
            )));
        }

        let stats = self
            .mutator
            .apply(&StatsRow(game_id), None, |current: &GameStats| {
                let play_count = current
                    .play_count
                    .checked_add(delta)
                    .ok_or_else(|| MutationError::Validation("play_count overflow".to_string()))?;
                Ok(GameStats {
                    play_count,
                    ..*current
                })
            })
            .await?;

        debug!(game_id, play_count = stats.play_count, "游玩次数已更新");
        self.audit(
            AuditAction::IncrementPlayCount,
            game_id,
            json!({ "delta": delta, "play_count": stats.play_count }),
        )
        .await;

        Ok(stats)
    }

    /// 提交一次评分并更新平均分
    #[instrument(skip(self))]
    pub async fn update_rating(&self, game_id: i64, rating: f64) -> Result<GameStats> {
        if !GameStats::is_valid_rating(rating) {
            return Err(MutationError::Validation(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}, got {rating}"
            )));
        }

        let stats = self
            .mutator
            .apply(&StatsRow(game_id), None, |current: &GameStats| {
                Ok(current.with_rating(rating))
            })
            .await?;

        debug!(
            game_id,
            average_rating = stats.average_rating,
            rating_count = stats.rating_count,
            "评分已更新"
        );
        self.audit(
            AuditAction::UpdateRating,
            game_id,
            json!({
                "rating": rating,
                "average_rating": stats.average_rating,
                "rating_count": stats.rating_count,
            }),
        )
        .await;

        Ok(stats)
    }

    pub async fn get_stats(&self, game_id: i64) -> Result<GameStats> {
        self.mutator
            .store()
            .game_stats(game_id)
            .await?
            .ok_or(MutationError::NotFound {
                entity: "game_stats",
                id: game_id,
            })
    }

    async fn audit(&self, action: AuditAction, game_id: i64, detail: serde_json::Value) {
        let event = AuditEvent::new(action, &ResourceKey::game_stats(game_id), detail);
        audit::emit(&self.audit, event).await;
    }
}

/// game_stats 行
struct StatsRow(i64);

#[async_trait]
impl<T: StoreTx> Mutation<T> for StatsRow {
    type Value = GameStats;
    type Output = GameStats;

    fn resource(&self) -> ResourceKey {
        ResourceKey::game_stats(self.0)
    }

    async fn load(&self, tx: &mut T) -> Result<GameStats> {
        tx.lock_game_stats(self.0)
            .await?
            .ok_or(MutationError::NotFound {
                entity: "game_stats",
                id: self.0,
            })
    }

    async fn store(&self, tx: &mut T, _current: &GameStats, next: GameStats) -> Result<GameStats> {
        tx.set_game_stats(&next).await?;
        Ok(next)
    }
}
