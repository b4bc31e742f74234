mod keys;
mod quota;
mod stale;
mod uids;
