//! Channel selection over the cached ability snapshot.
//!
//! A single priority-tiered, weight-proportional pick over
//! [`crate::cache::CachedChannel`] entries, in place of a cost/latency/
//! quality/round-robin strategy family keyed by name.

use rand::Rng;

use crate::cache::{CachedChannel, ChannelCache};
use crate::error::{RelayError, Result};

/// Picks one channel id for `(group, model)`.
///
/// `ignore_top_tier` restricts the pool to priorities strictly below the
/// remaining maximum (used by the retry controller to spill into backup
/// channels); otherwise the pool is restricted to the remaining maximum
/// priority. `exclude` removes channels already attempted this request.
pub async fn pick_channel(
    cache: &ChannelCache,
    group: &str,
    model: &str,
    ignore_top_tier: bool,
    exclude: &[i64],
) -> Result<i64> {
    let candidates = cache.lookup(group, model).await;
    pick_from(&candidates, ignore_top_tier, exclude, &mut rand::thread_rng())
}

fn pick_from(
    candidates: &[CachedChannel],
    ignore_top_tier: bool,
    exclude: &[i64],
    rng: &mut impl Rng,
) -> Result<i64> {
    let remaining: Vec<&CachedChannel> = candidates
        .iter()
        .filter(|c| !exclude.contains(&c.channel_id))
        .collect();

    if remaining.is_empty() {
        return Err(RelayError::NoChannelAvailable {
            group: String::new(),
            model: String::new(),
        });
    }

    let max_priority = remaining.iter().map(|c| c.priority).max().unwrap();
    let tier: Vec<&&CachedChannel> = remaining
        .iter()
        .filter(|c| {
            if ignore_top_tier {
                c.priority < max_priority
            } else {
                c.priority == max_priority
            }
        })
        .collect();

    // Falling back to the full remaining pool when the ignore_top_tier
    // filter empties the tier keeps retries spilling into whatever is left
    // rather than failing outright with live channels still on the table.
    let pool: Vec<&CachedChannel> = if tier.is_empty() {
        remaining
    } else {
        tier.into_iter().map(|c| *c).collect()
    };

    let total_weight: u64 = pool.iter().map(|c| c.weight.max(1) as u64).sum();
    let mut pick = rng.gen_range(0..total_weight);

    let mut sorted = pool;
    sorted.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

    for channel in &sorted {
        let w = channel.weight.max(1) as u64;
        if pick < w {
            return Ok(channel.channel_id);
        }
        pick -= w;
    }

    // Ties on identical cumulative weight are broken by ascending channel
    // id via the sort above; this is an unreachable fallback.
    Ok(sorted.last().expect("pool is non-empty").channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn ch(id: i64, priority: i64, weight: u32) -> CachedChannel {
        CachedChannel { channel_id: id, priority, weight }
    }

    #[test]
    fn empty_candidates_errors() {
        let mut rng = StepRng::new(0, 1);
        let result = pick_from(&[], false, &[], &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn restricts_to_top_priority_tier() {
        let candidates = vec![ch(1, 10, 1), ch(2, 5, 1)];
        let mut rng = StepRng::new(0, 1);
        let picked = pick_from(&candidates, false, &[], &mut rng).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn ignore_top_tier_spills_to_backup() {
        let candidates = vec![ch(1, 10, 1), ch(2, 5, 1)];
        let mut rng = StepRng::new(0, 1);
        let picked = pick_from(&candidates, true, &[], &mut rng).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn excluded_channels_are_removed() {
        let candidates = vec![ch(1, 10, 1), ch(2, 10, 1)];
        let mut rng = StepRng::new(0, 1);
        let picked = pick_from(&candidates, false, &[1], &mut rng).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn weight_zero_is_treated_as_minimum_one() {
        let candidates = vec![ch(1, 10, 0), ch(2, 10, 0)];
        let mut rng = StepRng::new(0, 1);
        assert!(pick_from(&candidates, false, &[], &mut rng).is_ok());
    }
}
