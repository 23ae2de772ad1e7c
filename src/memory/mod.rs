pub(crate) mod arena;
pub(crate) mod commit;
pub(crate) mod diag;
pub(crate) mod integration;
pub(crate) mod platform;
pub(crate) mod slot_pool;
pub(crate) mod stats;
pub(crate) mod varray;
pub(crate) mod vm;
pub(crate) mod vmem;
pub(crate) mod vpool;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
