use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use failure::Error;
use itertools::Itertools;
use ordered_float::OrderedFloat;

use crate::cache::codec::decode_grid;
use crate::cache::common::*;
use crate::cache::spatial::{bxy2zxy, proximity_radius, pxy2zxy, scoredist, tile_dist};

/// Takes a stack of phrasematch subqueries, retrieves and scores their
/// grids, stacks spatially co-located covers across indexes, and returns
/// the best-ranked candidate contexts.
pub fn coalesce(
    stack: Vec<PhrasematchSubquery>,
    opts: &CoalesceOpts,
) -> Result<Vec<CoalesceContext>, Error> {
    let mut contexts = match stack.len() {
        0 => return Err(InputError::EmptyStack.into()),
        1 => coalesce_single(&stack[0], opts)?,
        _ => coalesce_multi(stack, opts)?,
    };

    sort_contexts(&mut contexts);

    let mut out = Vec::with_capacity(MAX_CONTEXTS);
    if !contexts.is_empty() {
        let max_relevance = contexts[0].relev;
        let mut sets: HashSet<u32> = HashSet::new();
        for context in contexts {
            if out.len() >= MAX_CONTEXTS {
                break;
            }
            // contexts are sorted by relev desc, so the first threshold
            // miss ends the walk
            if max_relevance - context.relev >= 0.25 {
                break;
            }
            // collect each feature only once across indexes
            if sets.insert(context.entries[0].tmp_id) {
                out.push(context);
            }
        }
    }
    Ok(out)
}

fn get_matching_grids(
    subquery: &PhrasematchSubquery,
    max_results: usize,
) -> Result<Vec<u64>, Error> {
    match &subquery.cache {
        CacheRef::Memory(cache) => {
            Ok(cache.get_matching(&subquery.phrase, subquery.prefix, subquery.langfield, max_results))
        }
        CacheRef::RocksDb(cache) => {
            cache.get_matching(&subquery.phrase, subquery.prefix, subquery.langfield, max_results)
        }
    }
}

/// Binds a decoded grid to its subquery: weights the relev, stamps the
/// source index, and derives the cross-index tmp_id.
fn grid_to_coalesce_entry(
    grid: &MatchEntry,
    subquery: &PhrasematchSubquery,
    mask: u32,
) -> CoalesceEntry {
    CoalesceEntry {
        grid_entry: GridEntry {
            relev: grid.grid_entry.relev * subquery.weight,
            ..grid.grid_entry.clone()
        },
        matches_language: grid.matches_language,
        idx: subquery.idx,
        tmp_id: (u32::from(subquery.idx) << 25) + grid.grid_entry.id,
        mask,
        distance: 0.,
        scoredist: 0.,
    }
}

fn cover_sort_key(cover: &CoalesceEntry) -> (OrderedFloat<f64>, OrderedFloat<f64>, u16, u32, u16, u16) {
    (
        OrderedFloat(cover.grid_entry.relev),
        OrderedFloat(cover.scoredist),
        cover.idx,
        cover.grid_entry.id,
        cover.grid_entry.x,
        cover.grid_entry.y,
    )
}

/// The whole query matched one phrase: no stacking, just dedupe grids by
/// feature, score against proximity, and keep the best.
fn coalesce_single(
    subquery: &PhrasematchSubquery,
    opts: &CoalesceOpts,
) -> Result<Vec<CoalesceContext>, Error> {
    let (cz, cx, cy) = match opts.centerzxy {
        Some([z, x, y]) => (z as u16, x, y),
        None => (0, 0, 0),
    };
    let proximity = opts.centerzxy.is_some();

    // with a bbox the on-disk store can prune grids before the sort;
    // the memory back-end has no such fast path, so the in-loop filter
    // below does the work there
    let grids: Vec<u64> = match (&subquery.cache, &opts.bboxzxy) {
        (CacheRef::RocksDb(cache), Some(boxed)) => cache.get_matching_in_bbox(
            &subquery.phrase,
            subquery.prefix,
            subquery.langfield,
            PREFIX_MAX_GRID_LENGTH,
            [
                clamp_tile(boxed[1]),
                clamp_tile(boxed[2]),
                clamp_tile(boxed[3]),
                clamp_tile(boxed[4]),
            ],
        )?,
        (CacheRef::RocksDb(cache), None) => cache.get_matching(
            &subquery.phrase,
            subquery.prefix,
            subquery.langfield,
            std::usize::MAX,
        )?,
        (CacheRef::Memory(cache), _) => cache.get_matching(
            &subquery.phrase,
            subquery.prefix,
            subquery.langfield,
            std::usize::MAX,
        ),
    };

    let mut max_relevance: f64 = 0.;
    let mut last_id: u32 = 0;
    let mut last_relevance: f64 = 0.;
    let mut last_scoredist: f64 = 0.;
    let mut min_scoredist = std::f64::MAX;
    let mut feature_count: usize = 0;

    let mut covers: Vec<CoalesceEntry> = Vec::new();

    for grid in grids {
        let decoded = decode_grid(grid);
        let mut cover = grid_to_coalesce_entry(&decoded, subquery, 0);

        if let Some(boxed) = &opts.bboxzxy {
            let x = u32::from(cover.grid_entry.x);
            let y = u32::from(cover.grid_entry.y);
            if x < boxed[1] || y < boxed[2] || x > boxed[3] || y > boxed[4] {
                continue;
            }
        }

        if proximity {
            // runs of grids from the same tile and score are common;
            // reuse the previous distance instead of recomputing
            match covers.last() {
                Some(last)
                    if last.grid_entry.x == cover.grid_entry.x
                        && last.grid_entry.y == cover.grid_entry.y
                        && last.grid_entry.score == cover.grid_entry.score =>
                {
                    cover.distance = last.distance;
                    cover.scoredist = last.scoredist;
                }
                _ => {
                    cover.distance = tile_dist(
                        cx,
                        cy,
                        u32::from(cover.grid_entry.x),
                        u32::from(cover.grid_entry.y),
                    );
                    cover.scoredist =
                        scoredist(cz, cover.distance, cover.grid_entry.score, opts.radius);
                }
            }
            if !cover.matches_language && cover.distance > proximity_radius(cz, opts.radius) {
                cover.grid_entry.relev *= 0.96;
            }
        } else {
            cover.distance = 0.;
            cover.scoredist = f64::from(cover.grid_entry.score);
            if !cover.matches_language {
                cover.grid_entry.relev *= 0.96;
            }
        }

        // same feature as the previous grid but a weaker scoredist
        if last_id == cover.grid_entry.id && cover.scoredist <= last_scoredist {
            continue;
        }

        if feature_count > MAX_CONTEXTS {
            if cover.scoredist < min_scoredist {
                continue;
            }
            if cover.grid_entry.relev < last_relevance {
                // grids come out of the store sorted best-first; nothing
                // better is coming
                break;
            }
        }
        if max_relevance - cover.grid_entry.relev >= 0.25 {
            break;
        }
        if cover.grid_entry.relev > max_relevance {
            max_relevance = cover.grid_entry.relev;
        }

        let current_id = cover.grid_entry.id;
        let current_relevance = cover.grid_entry.relev;
        let current_scoredist = cover.scoredist;
        covers.push(cover);

        if last_id != current_id {
            feature_count += 1;
        }
        if !proximity && feature_count > MAX_CONTEXTS {
            break;
        }
        if current_scoredist < min_scoredist {
            min_scoredist = current_scoredist;
        }
        last_id = current_id;
        last_relevance = current_relevance;
        last_scoredist = current_scoredist;
    }

    covers.sort_by_key(|cover| Reverse(cover_sort_key(cover)));

    let mut seen: HashSet<u32> = HashSet::new();
    let mut contexts: Vec<CoalesceContext> = Vec::new();
    for cover in covers {
        if contexts.len() >= MAX_CONTEXTS {
            break;
        }
        // one context per feature; the sort already put its best cover first
        if !seen.insert(cover.grid_entry.id) {
            continue;
        }
        contexts.push(CoalesceContext {
            mask: cover.mask,
            relev: cover.grid_entry.relev,
            entries: vec![cover],
        });
    }
    Ok(contexts)
}

/// Multiple phrases matched: walk subqueries in zoom order, and stack
/// each grid onto previously coalesced contexts whose tile is a spatial
/// ancestor, as long as their query-token masks don't collide.
fn coalesce_multi(
    mut stack: Vec<PhrasematchSubquery>,
    opts: &CoalesceOpts,
) -> Result<Vec<CoalesceContext>, Error> {
    stack.sort_by_key(|subquery| (subquery.zoom, subquery.idx));

    // For each subquery, the distinct zooms below its own contributed by
    // other indexes. Grids can only inherit from these.
    let zoom_cache: Vec<Vec<u16>> = stack
        .iter()
        .map(|subquery| {
            stack
                .iter()
                .filter(|other| subquery.idx != other.idx && other.zoom < subquery.zoom)
                .map(|other| other.zoom)
                .dedup()
                .collect()
        })
        .collect();

    let (cz, cx, cy) = match opts.centerzxy {
        Some([z, x, y]) => (z as u16, x, y),
        None => (0, 0, 0),
    };
    let proximity = opts.centerzxy.is_some();

    let mut coalesced: HashMap<u64, Vec<CoalesceContext>> = HashMap::new();
    let mut contexts: Vec<CoalesceContext> = Vec::new();
    let mut max_relevance: f64 = 0.;

    for (i, subquery) in stack.iter().enumerate() {
        let first = i == 0;
        let last = i == stack.len() - 1;
        let z = subquery.zoom;

        // translate the bbox corners into this subquery's zoom
        let bbox = match &opts.bboxzxy {
            Some(boxed) => Some((
                bxy2zxy(boxed[0] as u16, boxed[1], boxed[2], z, false),
                bxy2zxy(boxed[0] as u16, boxed[3], boxed[4], z, true),
            )),
            None => None,
        };

        let grids = get_matching_grids(subquery, PREFIX_MAX_GRID_LENGTH)?;

        // grids coalesced during this subquery only become stacking
        // targets for later subqueries
        let mut to_add: HashMap<u64, Vec<CoalesceContext>> = HashMap::new();

        for grid in grids {
            let decoded = decode_grid(grid);
            let mut cover = grid_to_coalesce_entry(&decoded, subquery, subquery.mask);

            if proximity {
                let (dx, dy) = pxy2zxy(z, cover.grid_entry.x, cover.grid_entry.y, cz);
                cover.distance = tile_dist(cx, cy, dx, dy);
                cover.scoredist = scoredist(cz, cover.distance, cover.grid_entry.score, opts.radius);
                if !cover.matches_language && cover.distance > proximity_radius(cz, opts.radius) {
                    cover.grid_entry.relev *= 0.96;
                }
            } else {
                cover.distance = 0.;
                cover.scoredist = f64::from(cover.grid_entry.score);
                if !cover.matches_language {
                    cover.grid_entry.relev *= 0.96;
                }
            }

            if let Some(((minx, miny), (maxx, maxy))) = bbox {
                let x = u32::from(cover.grid_entry.x);
                let y = u32::from(cover.grid_entry.y);
                if x < minx || y < miny || x > maxx || y > maxy {
                    continue;
                }
            }

            // substitutions below can rewrite the tail of `entries`, so
            // ancestor keys must come from the grid's own coordinates
            let grid_x = cover.grid_entry.x;
            let grid_y = cover.grid_entry.y;
            let zxy =
                (u64::from(z) << 28) + (u64::from(grid_x) << 14) + u64::from(grid_y);

            let mut context_mask = cover.mask;
            let mut context_relevance = cover.grid_entry.relev;
            let mut entries: Vec<CoalesceEntry> = vec![cover];

            for other_zoom in &zoom_cache[i] {
                let shift = z - other_zoom;
                let pxy = (u64::from(*other_zoom) << 28)
                    + ((u64::from(grid_x) >> shift) << 14)
                    + (u64::from(grid_y) >> shift);

                if let Some(parents) = coalesced.get(&pxy) {
                    let mut last_mask: u32 = 0;
                    let mut last_relevance: f64 = 0.;
                    for parent_context in parents {
                        for parent in &parent_context.entries {
                            if parent.mask == last_mask
                                && parent.grid_entry.relev > last_relevance
                            {
                                // same token coverage as the cover we just
                                // appended, strictly more relevant: swap it in
                                entries.pop();
                                entries.push(parent.clone());
                                context_relevance -= last_relevance;
                                context_relevance += parent.grid_entry.relev;
                                last_mask = parent.mask;
                                last_relevance = parent.grid_entry.relev;
                            } else if context_mask & parent.mask == 0 {
                                entries.push(parent.clone());
                                context_relevance += parent.grid_entry.relev;
                                context_mask |= parent.mask;
                                last_mask = parent.mask;
                                last_relevance = parent.grid_entry.relev;
                            }
                        }
                    }
                }
            }

            if context_relevance > max_relevance {
                max_relevance = context_relevance;
            }

            if last {
                if entries.len() == 1 {
                    // lone cover, nothing stacked on it
                    context_relevance -= 0.01;
                } else if entries[0].mask > entries[1].mask {
                    // descending-mask arrangement
                    context_relevance -= 0.01;
                }
                if max_relevance - context_relevance < 0.25 {
                    contexts.push(CoalesceContext {
                        entries,
                        mask: context_mask,
                        relev: context_relevance,
                    });
                }
            } else if first || entries.len() > 1 {
                to_add.entry(zxy).or_insert_with(Vec::new).push(CoalesceContext {
                    entries,
                    mask: context_mask,
                    relev: context_relevance,
                });
            }
        }

        for (zxy, add) in to_add {
            coalesced.entry(zxy).or_insert_with(Vec::new).extend(add);
        }
    }

    for (_, matched) in coalesced {
        for context in matched {
            if max_relevance - context.relev < 0.25 {
                contexts.push(context);
            }
        }
    }

    Ok(contexts)
}

fn clamp_tile(coord: u32) -> u16 {
    std::cmp::min(coord, u32::from(std::u16::MAX)) as u16
}
