//! Reference path selector.
//!
//! Given a flattened directed cost grid, produces for every ordered relay
//! pair a list of candidate routes sorted by cost. Work is split into
//! segments of consecutive source relays which are processed in parallel.
use rayon::prelude::*;

pub const MAX_ROUTES_PER_ENTRY: usize = 16;
pub const MAX_RELAYS_PER_ROUTE: usize = 5;

/// Signature shared by every path selector:
/// `(relay_count, segment_count, costs, cost_threshold, datacenter_ids)`.
pub type PathSelector = fn(usize, usize, &[i32], i32, &[u64]) -> Vec<RouteEntry>;

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Route {
    pub cost: i32,
    pub hash: u32,
    /// Relay indices into the matrix ordering, source first.
    pub relays: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RouteEntry {
    pub direct_cost: i32,
    pub routes: Vec<Route>,
}

impl Default for RouteEntry {
    fn default() -> Self {
        RouteEntry {
            direct_cost: -1,
            routes: Vec::new(),
        }
    }
}

impl RouteEntry {
    pub fn num_routes(&self) -> usize {
        self.routes.len()
    }
}

/// FNV-1a over the little-endian bytes of each relay index.
pub fn route_hash(relays: &[u32]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for relay in relays {
        for byte in relay.to_le_bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(16777619);
        }
    }
    hash
}

/// Half-open range of source relays covered by `segment`.
pub fn segment_bounds(segment: usize, num_segments: usize, num_relays: usize) -> (usize, usize) {
    let start = segment * num_relays / num_segments;
    let end = (segment + 1) * num_relays / num_segments;
    (start, end)
}

#[derive(Clone, Copy, Debug)]
struct Indirect {
    relay: u32,
    cost: i32,
}

/// Keeps the cheapest routes for one pair, rejecting loops and routes that
/// pass through the same datacenter twice.
struct RouteManager<'a> {
    routes: Vec<Route>,
    datacenter_ids: &'a [u64],
}

impl<'a> RouteManager<'a> {
    fn new(datacenter_ids: &'a [u64]) -> Self {
        RouteManager {
            routes: Vec::with_capacity(MAX_ROUTES_PER_ENTRY),
            datacenter_ids,
        }
    }

    fn add_route(&mut self, cost: i32, relays: &[u32]) {
        if cost < 0 || relays.len() < 2 || relays.len() > MAX_RELAYS_PER_ROUTE {
            return;
        }

        for (i, &a) in relays.iter().enumerate() {
            for &b in &relays[i + 1..] {
                if a == b {
                    return;
                }
                let dc_a = self.datacenter_ids.get(a as usize).copied().unwrap_or(0);
                let dc_b = self.datacenter_ids.get(b as usize).copied().unwrap_or(0);
                // 0 means the relay has no datacenter assigned
                if dc_a != 0 && dc_a == dc_b {
                    return;
                }
            }
        }

        let hash = route_hash(relays);
        if self
            .routes
            .iter()
            .any(|route| route.hash == hash && route.relays == relays)
        {
            return;
        }

        let position = self.routes.partition_point(|route| route.cost <= cost);
        if position >= MAX_ROUTES_PER_ENTRY {
            return;
        }
        self.routes.insert(
            position,
            Route {
                cost,
                hash,
                relays: relays.to_vec(),
            },
        );
        self.routes.truncate(MAX_ROUTES_PER_ENTRY);
    }
}

/// Reference implementation of the path selection contract.
///
/// Returns `relay_count * relay_count` entries in row-major order. The
/// diagonal is always empty. A candidate route through intermediate relays
/// is only kept when it beats the direct cost by at least `cost_threshold`,
/// or when there is no direct edge at all.
pub fn optimize(
    relay_count: usize,
    num_segments: usize,
    costs: &[i32],
    cost_threshold: i32,
    datacenter_ids: &[u64],
) -> Vec<RouteEntry> {
    let n = relay_count;
    if n == 0 || costs.len() != n * n {
        return Vec::new();
    }
    let num_segments = num_segments.clamp(1, n);
    let cost = |a: usize, b: usize| costs[a * n + b];

    // Phase 1: for every pair, intermediate relays that improve on the direct cost.
    let indirect: Vec<Vec<Vec<Indirect>>> = per_segment(n, num_segments, |i| {
        (0..n)
            .map(|j| {
                if i == j {
                    return Vec::new();
                }
                let direct = cost(i, j);
                let mut candidates: Vec<Indirect> = (0..n)
                    .filter(|&k| k != i && k != j)
                    .filter_map(|k| {
                        let (ik, kj) = (cost(i, k), cost(k, j));
                        if ik < 0 || kj < 0 {
                            return None;
                        }
                        let total = ik + kj;
                        if direct >= 0 && total > direct - cost_threshold {
                            return None;
                        }
                        Some(Indirect {
                            relay: k as u32,
                            cost: total,
                        })
                    })
                    .collect();
                candidates.sort_by_key(|candidate| (candidate.cost, candidate.relay));
                candidates
            })
            .collect()
    });

    // Phase 2: build the route list for every pair from the improving candidates.
    let entries: Vec<Vec<RouteEntry>> = per_segment(n, num_segments, |i| {
        (0..n)
            .map(|j| {
                if i == j {
                    return RouteEntry::default();
                }
                let direct = cost(i, j);
                let improves = |total: i32| direct < 0 || total <= direct - cost_threshold;
                let (src, dst) = (i as u32, j as u32);
                let mut manager = RouteManager::new(datacenter_ids);

                if direct >= 0 {
                    manager.add_route(direct, &[src, dst]);
                }

                for y in &indirect[i][j] {
                    let iy = y.relay as usize;
                    manager.add_route(y.cost, &[src, y.relay, dst]);

                    if let Some(x) = indirect[i][iy].first() {
                        let total = x.cost + cost(iy, j);
                        if improves(total) {
                            manager.add_route(total, &[src, x.relay, y.relay, dst]);
                        }
                    }

                    if let Some(z) = indirect[iy][j].first() {
                        let total = cost(i, iy) + z.cost;
                        if improves(total) {
                            manager.add_route(total, &[src, y.relay, z.relay, dst]);
                        }
                    }
                }

                RouteEntry {
                    direct_cost: direct,
                    routes: manager.routes,
                }
            })
            .collect()
    });

    entries.into_iter().flatten().collect()
}

/// Runs `row` for every source relay, parallel across segments, keeping row order.
fn per_segment<T, F>(n: usize, num_segments: usize, row: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    (0..num_segments)
        .into_par_iter()
        .map(|segment| {
            let (start, end) = segment_bounds(segment, num_segments, n);
            (start..end).map(&row).collect::<Vec<T>>()
        })
        .collect::<Vec<Vec<T>>>()
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_bounds_cover_all_relays() {
        for (segments, relays) in [(1, 7), (3, 7), (7, 7), (20, 100)] {
            let mut next = 0;
            for segment in 0..segments {
                let (start, end) = segment_bounds(segment, segments, relays);
                assert_eq!(start, next);
                next = end;
            }
            assert_eq!(next, relays);
        }
    }

    #[test]
    fn test_route_hash() {
        assert_eq!(route_hash(&[]), 0x811c9dc5);
        assert_eq!(route_hash(&[0, 1]), route_hash(&[0, 1]));
        assert_ne!(route_hash(&[0, 1]), route_hash(&[1, 0]));
    }

    #[test]
    fn test_all_sentinel_grid_has_no_routes() {
        let costs = vec![-1; 9];
        let entries = optimize(3, 3, &costs, 1, &[1, 2, 3]);
        assert_eq!(entries.len(), 9);
        assert!(entries.iter().all(|entry| entry.routes.is_empty()));
    }

    #[test]
    fn test_indirect_route_beats_direct() {
        #[rustfmt::skip]
        let costs = vec![
            -1, 100, 10,
            100, -1, 10,
            10, 10, -1,
        ];
        let entries = optimize(3, 1, &costs, 1, &[1, 2, 3]);

        let entry = &entries[1];
        assert_eq!(entry.direct_cost, 100);
        assert_eq!(entry.routes[0].relays, vec![0, 2, 1]);
        assert_eq!(entry.routes[0].cost, 20);
        assert_eq!(entry.routes[1].relays, vec![0, 1]);
        assert_eq!(entry.routes[1].cost, 100);
    }

    #[test]
    fn test_threshold_rejects_marginal_improvement() {
        #[rustfmt::skip]
        let costs = vec![
            -1, 20, 10,
            20, -1, 10,
            10, 10, -1,
        ];
        // 0 -> 2 -> 1 costs 20, same as direct
        let entries = optimize(3, 1, &costs, 1, &[1, 2, 3]);
        assert_eq!(entries[1].routes.len(), 1);
        assert_eq!(entries[1].routes[0].relays, vec![0, 1]);
    }

    #[test]
    fn test_missing_direct_edge_uses_any_indirect() {
        #[rustfmt::skip]
        let costs = vec![
            -1, -1, 30,
            -1, -1, 30,
            30, 30, -1,
        ];
        let entries = optimize(3, 3, &costs, 5, &[1, 2, 3]);
        assert_eq!(entries[1].direct_cost, -1);
        assert_eq!(entries[1].routes.len(), 1);
        assert_eq!(entries[1].routes[0].relays, vec![0, 2, 1]);
        assert_eq!(entries[1].routes[0].cost, 60);
    }

    #[test]
    fn test_same_datacenter_routes_rejected() {
        #[rustfmt::skip]
        let costs = vec![
            -1, 100, 10,
            100, -1, 10,
            10, 10, -1,
        ];
        // relays 1 and 2 share a datacenter
        let entries = optimize(3, 1, &costs, 1, &[1, 2, 2]);
        assert_eq!(entries[1].routes.len(), 1);
        assert_eq!(entries[1].routes[0].relays, vec![0, 1]);
        assert!(entries[5].routes.is_empty());
        assert!(entries[7].routes.is_empty());
    }

    #[test]
    fn test_segmentation_does_not_change_result() {
        let n = 12;
        let costs: Vec<i32> = (0..n * n)
            .map(|idx| {
                let (i, j) = (idx / n, idx % n);
                if i == j { -1 } else { ((i * 7 + j * 13) % 50 + 5) as i32 }
            })
            .collect();
        let dcs: Vec<u64> = (1..=n as u64).collect();

        let single = optimize(n, 1, &costs, 1, &dcs);
        let segmented = optimize(n, 5, &costs, 1, &dcs);
        assert_eq!(single, segmented);
        assert!(single.iter().all(|entry| entry.routes.len() <= MAX_ROUTES_PER_ENTRY));
        assert!(
            single
                .iter()
                .flat_map(|entry| &entry.routes)
                .all(|route| route.relays.len() <= MAX_RELAYS_PER_ROUTE)
        );
    }
}
