//! Search-cell model, initial grid tiling, and the adaptive splitter.

use crate::config::RegionConfig;
use crate::geo::{meters_to_lat_degrees, meters_to_lng_degrees};

/// One circular search cell. Cells form an implicit quadtree through
/// `parent_cell_key`/`depth`; the tree itself lives only in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub run_id: i64,
    pub region_name: String,
    /// Unique within a run; deterministic so replanning never collides
    /// with persisted rows.
    pub cell_key: String,
    pub parent_cell_key: Option<String>,
    pub depth: i64,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_m: f64,
    pub min_radius_m: f64,
}

/// Tile the region's bbox into overlapping cells at the initial radius.
///
/// The latitude step is fixed, but the longitude step is recomputed at each
/// row's latitude; a fixed step would under- or over-cover away from the
/// equator. The NE bound is inclusive with a small epsilon so floating-point
/// rounding never drops the edge row or column.
pub fn generate_initial_cells(region: &RegionConfig, run_id: i64) -> Vec<Cell> {
    let step_m = (region.initial_radius_m * region.overlap_step_ratio).max(1.0);
    let lat_step = meters_to_lat_degrees(step_m);

    let mut cells = Vec::new();
    let mut lat = region.sw_lat();
    let mut row = 0;
    while lat <= region.ne_lat() + 1e-9 {
        let lng_step = meters_to_lng_degrees(step_m, lat);
        if lng_step <= 0.0 {
            // Degenerate latitude (poles); nothing sane to tile.
            break;
        }

        let mut lng = region.sw_lng();
        let mut col = 0;
        while lng <= region.ne_lng() + 1e-9 {
            cells.push(Cell {
                run_id,
                region_name: region.name.clone(),
                cell_key: format!("{}:d0:r{}:c{}", region.name, row, col),
                parent_cell_key: None,
                depth: 0,
                center_lat: lat,
                center_lng: lng,
                radius_m: region.initial_radius_m,
                min_radius_m: region.min_radius_m,
            });
            lng += lng_step;
            col += 1;
        }

        lat += lat_step;
        row += 1;
    }

    cells
}

/// Split a saturated cell into four half-radius children, or nothing when the
/// next radius would fall below the region's floor.
///
/// Children sit on the four quadrant diagonals at `overlap_factor` times the
/// child radius, so adjacent child circles overlap and entities near a child
/// boundary are not systematically missed.
pub fn split_cell(cell: &Cell, overlap_factor: f64) -> Vec<Cell> {
    let next_radius = cell.radius_m / 2.0;
    if next_radius < cell.min_radius_m {
        return Vec::new();
    }

    let offset_m = next_radius * overlap_factor;
    let lat_off = meters_to_lat_degrees(offset_m);
    let lng_off = meters_to_lng_degrees(offset_m, cell.center_lat);

    let offsets = [
        (lat_off, lng_off),
        (lat_off, -lng_off),
        (-lat_off, lng_off),
        (-lat_off, -lng_off),
    ];

    offsets
        .iter()
        .enumerate()
        .map(|(idx, (dlat, dlng))| Cell {
            run_id: cell.run_id,
            region_name: cell.region_name.clone(),
            cell_key: format!("{}.{}", cell.cell_key, idx),
            parent_cell_key: Some(cell.cell_key.clone()),
            depth: cell.depth + 1,
            center_lat: cell.center_lat + dlat,
            center_lng: cell.center_lng + dlng,
            radius_m: next_radius,
            min_radius_m: cell.min_radius_m,
        })
        .collect()
}

/// Worst-case calls for one cell if every descendant saturates:
/// `1 + 4 * recurse(radius / 2)` until the radius floor stops the recursion.
pub fn estimate_calls_for_radius(radius_m: f64, min_radius_m: f64) -> u64 {
    if radius_m / 2.0 < min_radius_m {
        return 1;
    }
    1 + 4 * estimate_calls_for_radius(radius_m / 2.0, min_radius_m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_region() -> RegionConfig {
        RegionConfig {
            name: "test".to_string(),
            bbox: [0.0, 0.0, 0.01, 0.01],
            initial_radius_m: 100.0,
            min_radius_m: 50.0,
            overlap_step_ratio: 0.7,
        }
    }

    fn cell(radius_m: f64, min_radius_m: f64) -> Cell {
        Cell {
            run_id: 1,
            region_name: "test".to_string(),
            cell_key: "test:d0:r0:c0".to_string(),
            parent_cell_key: None,
            depth: 0,
            center_lat: 0.005,
            center_lng: 0.005,
            radius_m,
            min_radius_m,
        }
    }

    #[test]
    fn grid_count_is_deterministic() {
        let region = test_region();
        // step = 70 m = ~6.288e-4 degrees; 16 rows and 16 columns fit the
        // 0.01-degree bbox inclusively.
        let cells = generate_initial_cells(&region, 1);
        assert_eq!(cells.len(), 256);
        assert_eq!(generate_initial_cells(&region, 1).len(), cells.len());
    }

    #[test]
    fn grid_centers_stay_within_one_step_of_bbox() {
        let region = test_region();
        let step_deg = meters_to_lat_degrees(70.0);
        for cell in generate_initial_cells(&region, 1) {
            assert!(cell.center_lat >= region.sw_lat());
            assert!(cell.center_lat <= region.ne_lat() + step_deg);
            assert!(cell.center_lng >= region.sw_lng());
            assert!(cell.center_lng <= region.ne_lng() + step_deg);
        }
    }

    #[test]
    fn grid_keys_are_row_major_and_unique() {
        let cells = generate_initial_cells(&test_region(), 1);
        assert_eq!(cells[0].cell_key, "test:d0:r0:c0");
        assert_eq!(cells[1].cell_key, "test:d0:r0:c1");

        let mut keys: Vec<&str> = cells.iter().map(|c| c.cell_key.as_str()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), cells.len());
    }

    #[test]
    fn polar_latitude_terminates_generation() {
        // At the pole the longitude step degenerates to zero and tiling
        // stops instead of looping.
        let mut region = test_region();
        region.bbox = [90.0, 0.0, 90.00001, 0.01];
        assert!(generate_initial_cells(&region, 1).is_empty());
    }

    #[test]
    fn split_produces_four_half_radius_children() {
        let parent = cell(100.0, 50.0);
        let children = split_cell(&parent, 0.8);
        assert_eq!(children.len(), 4);
        for (idx, child) in children.iter().enumerate() {
            assert_eq!(child.radius_m, 50.0);
            assert_eq!(child.depth, 1);
            assert_eq!(child.min_radius_m, 50.0);
            assert_eq!(child.cell_key, format!("test:d0:r0:c0.{}", idx));
            assert_eq!(child.parent_cell_key.as_deref(), Some("test:d0:r0:c0"));
        }
    }

    #[test]
    fn split_stops_at_radius_floor() {
        let parent = cell(100.0, 51.0);
        assert!(split_cell(&parent, 0.8).is_empty());
    }

    #[test]
    fn split_children_overlap_the_parent() {
        let parent = cell(100.0, 50.0);
        for child in split_cell(&parent, 0.8) {
            // Offset is 0.8 * 50 m = 40 m, well inside the parent circle.
            let dlat = (child.center_lat - parent.center_lat).abs();
            assert!(dlat > 0.0);
            assert!(dlat < meters_to_lat_degrees(parent.radius_m));
        }
    }

    #[test]
    fn call_estimate_follows_quadtree_recursion() {
        assert_eq!(estimate_calls_for_radius(100.0, 51.0), 1);
        assert_eq!(estimate_calls_for_radius(100.0, 50.0), 5);
        assert_eq!(estimate_calls_for_radius(100.0, 25.0), 21);
    }
}
