pub mod elements;
pub mod gradient;
pub mod grid;
pub mod merge_sort;
