//! City ranking over the trailing day of hourly aggregates.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::categorizer;
use crate::models::{CityRanking, HourlyAggregate};

// ---

pub const RANKING_WINDOW_HOURS: i64 = 24;

#[derive(Default)]
struct CityAcc<'a> {
    aqi_sum: f64,
    aqi_n: u32,
    pm25_sum: f64,
    pm25_n: u32,
    sensors: BTreeSet<&'a str>,
    last_updated: Option<DateTime<Utc>>,
}

/// Rank cities by their mean hourly AQI over the last 24 hours.
///
/// Lower AQI ranks first. Ties go to the city with more sensors, then to
/// the lexicographically smaller name, so the order is total. Ranks are
/// 1-based and consecutive.
pub fn rank_cities(aggregates: &[HourlyAggregate], now: DateTime<Utc>) -> Vec<CityRanking> {
    // ---
    let since = now - ChronoDuration::hours(RANKING_WINDOW_HOURS);

    // Fold in a fixed order so float sums do not depend on input order.
    let mut window: Vec<&HourlyAggregate> = aggregates.iter().filter(|a| a.hour >= since).collect();
    window.sort_by(|a, b| {
        (&a.location_name, &a.sensor_id, a.hour).cmp(&(&b.location_name, &b.sensor_id, b.hour))
    });

    let mut cities: BTreeMap<&str, CityAcc<'_>> = BTreeMap::new();
    for agg in window {
        let acc = cities.entry(agg.location_name.as_str()).or_default();
        acc.aqi_sum += agg.avg_aqi;
        acc.aqi_n += 1;
        if let Some(pm25) = agg.avg_pm25 {
            acc.pm25_sum += pm25;
            acc.pm25_n += 1;
        }
        acc.sensors.insert(agg.sensor_id.as_str());
        acc.last_updated = acc.last_updated.max(Some(agg.hour));
    }

    let mut rankings: Vec<CityRanking> = cities
        .into_iter()
        .filter_map(|(name, acc)| {
            let last_updated = acc.last_updated?;
            let current_aqi = acc.aqi_sum / f64::from(acc.aqi_n);
            let current_pm25 = (acc.pm25_n > 0).then(|| acc.pm25_sum / f64::from(acc.pm25_n));
            let category = categorizer::category(current_aqi);
            Some(CityRanking {
                location_name: name.to_string(),
                current_aqi,
                current_pm25,
                sensor_count: acc.sensors.len() as u32,
                last_updated,
                rank: 0,
                category,
                status_emoji: category.status_emoji().to_string(),
            })
        })
        .collect();

    rankings.sort_by(compare);
    for (i, city) in rankings.iter_mut().enumerate() {
        city.rank = i as u32 + 1;
    }
    rankings
}

fn compare(a: &CityRanking, b: &CityRanking) -> Ordering {
    // ---
    a.current_aqi
        .total_cmp(&b.current_aqi)
        .then_with(|| b.sensor_count.cmp(&a.sensor_count))
        .then_with(|| a.location_name.cmp(&b.location_name))
}
