mod helpers;

mod tests_basic;


// Priority 3 — metadata surfaces
mod tests_estimate;
mod tests_layout;
