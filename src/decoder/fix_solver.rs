//! Angles → object poses.
//!
//! A sensor is placed where the rays from both base stations pass closest
//! to each other. Objects with at least three placed, non-collinear sensors
//! also get an orientation.

use heapless::Vec;

use crate::config::{BaseStationGeometry, GeometryConfig, ObjectGeometry};
use crate::decoder::geometry::{self, Quaternion, Vec3};
use crate::state::{
    FixLevel, ObjectPosition, SensorAngles, MAX_NUM_INPUTS, MAX_NUM_OBJECTS, NUM_BASE_STATIONS,
};
use crate::time::Timestamp;

/// What the solver needs to know about one base station slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StationView {
    pub fix_level: FixLevel,
    /// Current cycle of the station; `None` unless synced.
    pub cycle_idx: Option<u32>,
}

/// One sensor placed in the world frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorFix {
    pub local: Vec3,
    pub world: Vec3,
    /// Gap between the two station rays.
    pub residual: f32,
}

pub struct FixSolver {
    geometry: GeometryConfig,
    max_angle_age: u32,
}

impl FixSolver {
    pub fn new(geometry: GeometryConfig, max_angle_age: u32) -> Self {
        Self {
            geometry,
            max_angle_age,
        }
    }

    /// One result per configured object.
    pub fn solve(
        &self,
        time: Timestamp,
        angles: &[SensorAngles],
        stations: &[StationView; NUM_BASE_STATIONS],
    ) -> Vec<ObjectPosition, MAX_NUM_OBJECTS> {
        let mut out = Vec::new();
        for (idx, object) in self.geometry.objects.iter().enumerate() {
            let _ = out.push(self.solve_object(idx as u32, object, time, angles, stations));
        }
        out
    }

    pub fn solve_object(
        &self,
        object_idx: u32,
        object: &ObjectGeometry,
        time: Timestamp,
        angles: &[SensorAngles],
        stations: &[StationView; NUM_BASE_STATIONS],
    ) -> ObjectPosition {
        let mut fixes: Vec<SensorFix, MAX_NUM_INPUTS> = Vec::new();
        for sensor in object.sensors.iter() {
            let Some(a) = angles.get(sensor.input_idx as usize) else {
                continue;
            };
            if let Some((world, residual)) = self.triangulate(a, stations) {
                let _ = fixes.push(SensorFix {
                    local: sensor.pos,
                    world,
                    residual,
                });
            }
        }

        if fixes.is_empty() {
            return ObjectPosition::unresolved(time, object_idx, signal_level(stations));
        }

        let mut local: Vec<Vec3, MAX_NUM_INPUTS> = Vec::new();
        let mut world: Vec<Vec3, MAX_NUM_INPUTS> = Vec::new();
        let mut pos_delta = 0.0f32;
        for f in fixes.iter() {
            let _ = local.push(f.local);
            let _ = world.push(f.world);
            pos_delta = pos_delta.max(f.residual);
        }
        let (Some(local_c), Some(world_c)) = (geometry::centroid(&local), geometry::centroid(&world))
        else {
            return ObjectPosition::unresolved(time, object_idx, signal_level(stations));
        };

        // No orientation: report the centroid of the triangulated sensors.
        let (fix_level, pos, q) = match orientation(&fixes) {
            Some(r) => (
                FixLevel::FullFix,
                geometry::sub(world_c, geometry::mat_mul_vec(&r, local_c)),
                Quaternion::from_rotation(&r),
            ),
            None => (FixLevel::PartialVis, world_c, Quaternion::default()),
        };

        ObjectPosition {
            time,
            object_idx,
            fix_level,
            pos,
            pos_delta,
            q: q.to_array(),
        }
    }

    /// World position of one sensor from both stations' fresh angles.
    pub fn triangulate(
        &self,
        angles: &SensorAngles,
        stations: &[StationView; NUM_BASE_STATIONS],
    ) -> Option<(Vec3, f32)> {
        let r0 = self.station_ray(0, angles, stations)?;
        let r1 = self.station_ray(1, angles, stations)?;
        let hit = geometry::closest_approach(r0.0, r0.1, r1.0, r1.1)?;
        Some((hit.point, hit.distance))
    }

    fn station_ray(
        &self,
        bs: usize,
        angles: &SensorAngles,
        stations: &[StationView; NUM_BASE_STATIONS],
    ) -> Option<(Vec3, Vec3)> {
        let cycle = stations[bs].cycle_idx?;
        let h = angles.fresh_angle(bs * 2, cycle, self.max_angle_age)?;
        let v = angles.fresh_angle(bs * 2 + 1, cycle, self.max_angle_age)?;
        let BaseStationGeometry { origin, mat } = &self.geometry.base_stations[bs];
        let dir = geometry::mat_mul_vec(mat, geometry::station_ray(h, v));
        Some((*origin, dir))
    }
}

/// Level when nothing could be placed: the weakest station that has seen
/// anything at all.
fn signal_level(stations: &[StationView; NUM_BASE_STATIONS]) -> FixLevel {
    stations
        .iter()
        .map(|s| s.fix_level.min(FixLevel::CycleSynced))
        .filter(|l| *l > FixLevel::NoSignals)
        .min()
        .unwrap_or(FixLevel::NoSignals)
}

/// Rotation from the widest triangle among the placed sensors.
fn orientation(fixes: &[SensorFix]) -> Option<[f32; 9]> {
    if fixes.len() < 3 {
        return None;
    }
    let a = 0;
    let b = (1..fixes.len()).max_by(|&i, &j| {
        let di = geometry::norm(geometry::sub(fixes[i].local, fixes[a].local));
        let dj = geometry::norm(geometry::sub(fixes[j].local, fixes[a].local));
        di.total_cmp(&dj)
    })?;
    let area = |k: usize| {
        geometry::norm(geometry::cross(
            geometry::sub(fixes[b].local, fixes[a].local),
            geometry::sub(fixes[k].local, fixes[a].local),
        ))
    };
    let c = (1..fixes.len())
        .filter(|&k| k != b)
        .max_by(|&i, &j| area(i).total_cmp(&area(j)))?;
    if area(c) < geometry::COLLINEAR_EPS {
        return None;
    }
    geometry::rotation_between(
        [fixes[a].local, fixes[b].local, fixes[c].local],
        [fixes[a].world, fixes[b].world, fixes[c].world],
    )
}
