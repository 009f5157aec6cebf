//! Behavioural scenarios for snapshot lineage.

mod lineage;
