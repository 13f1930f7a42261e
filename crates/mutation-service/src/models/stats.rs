use serde::{Deserialize, Serialize};

pub const MIN_RATING: f64 = 1.0;
pub const MAX_RATING: f64 = 5.0;

/// 游戏统计计数器
///
/// `play_count` 单调不减；`average_rating` 为空或位于 [1, 5]，
/// 由 `rating_count` 个评分的滑动平均得到。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameStats {
    pub id: i64,
    pub play_count: i64,
    pub average_rating: Option<f64>,
    pub rating_count: i64,
}

impl GameStats {
    /// 尚无游玩与评分的统计行
    pub fn empty(id: i64) -> Self {
        Self {
            id,
            play_count: 0,
            average_rating: None,
            rating_count: 0,
        }
    }

    pub fn is_valid_rating(rating: f64) -> bool {
        rating.is_finite() && (MIN_RATING..=MAX_RATING).contains(&rating)
    }

    /// 并入一个新评分后的统计
    pub fn with_rating(&self, rating: f64) -> Self {
        let n = self.rating_count as f64;
        let average = match self.average_rating {
            Some(avg) if self.rating_count > 0 => (avg * n + rating) / (n + 1.0),
            _ => rating,
        };
        Self {
            average_rating: Some(average.clamp(MIN_RATING, MAX_RATING)),
            rating_count: self.rating_count + 1,
            ..*self
        }
    }
}
