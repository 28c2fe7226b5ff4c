//! Trade history normalization shared by the adapters.
//!
//! Two exchange quirks are handled here:
//!
//! - a fill that takes a position through zero is reported as two legs
//!   sharing one trade id; the legs are merged by summing quantity and fee,
//! - an exchange that splits recent and archived trades into two stores may
//!   return the same record from both; the archive copy is dropped.
//!
//! Adapters only apply the second step. Legs are merged by the caller after
//! the last page, so a page keeps the exchange's raw record count.

use ahash::AHashMap;
use mx_core::Execution;

/// Merge legs sharing an execution id, keeping first-seen order. The merged
/// record keeps the first leg's price, timestamp and order fields.
pub fn merge_split_legs(execs: Vec<Execution>) -> Vec<Execution> {
    let mut index: AHashMap<String, usize> = AHashMap::with_capacity(execs.len());
    let mut out: Vec<Execution> = Vec::with_capacity(execs.len());
    for exec in execs {
        match index.get(&exec.exec_id) {
            Some(&i) => {
                let merged = &mut out[i];
                merged.qty += exec.qty;
                merged.fee += exec.fee;
                if exec.leaves_qty.is_some() {
                    merged.leaves_qty = exec.leaves_qty;
                }
            }
            None => {
                index.insert(exec.exec_id.clone(), out.len());
                out.push(exec);
            }
        }
    }
    out
}

/// Combine the recent and archived stores. Each recent record cancels at
/// most one archive record with the same id and quantity, so the two legs of
/// a split fill both survive while a record held by both stores is kept
/// once. The result is sorted by time.
pub fn merge_stores(recent: Vec<Execution>, archived: Vec<Execution>) -> Vec<Execution> {
    let mut copies: AHashMap<(String, u64), usize> = AHashMap::with_capacity(recent.len());
    for e in &recent {
        *copies.entry((e.exec_id.clone(), e.qty.to_bits())).or_default() += 1;
    }
    let mut all: Vec<Execution> = archived
        .into_iter()
        .filter(|e| match copies.get_mut(&(e.exec_id.clone(), e.qty.to_bits())) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        })
        .collect();
    all.extend(recent);
    sort_by_time(&mut all);
    all
}

/// Join a page to the records carried over from the previous one. A page
/// that starts at the carried timestamp repeats them; repeats are dropped.
pub fn join_pages(carried: Vec<Execution>, page: Vec<Execution>) -> Vec<Execution> {
    merge_stores(carried, page)
}

/// Stable ascending sort by timestamp.
pub fn sort_by_time(execs: &mut [Execution]) {
    execs.sort_by_key(|e| e.timestamp);
}
