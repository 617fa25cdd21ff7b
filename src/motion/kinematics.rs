// src/motion/kinematics.rs
use crate::config::{KinematicConfig, KinematicsType};
use crate::motion::{MotionError, NUM_AXES};

/// Mapping between cartesian coordinates and motor positions.
pub trait Kinematics: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> KinematicsType;

    /// Convert Cartesian coordinates to motor positions
    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> Result<[f64; 3], MotionError>;

    /// Convert motor positions to Cartesian coordinates
    fn motors_to_cartesian(&self, motors: &[f64; 3]) -> Result<[f64; 3], MotionError>;

    /// Absolute planner position, in steps, for a target in mm.
    ///
    /// Linear kinematics plan in axis space, so this is plain per-axis scaling.
    fn target_steps(
        &self,
        target: &[f64; NUM_AXES],
        steps_per_unit: &[f64; NUM_AXES],
    ) -> Result<[i64; NUM_AXES], MotionError> {
        Ok(std::array::from_fn(|axis| {
            (target[axis] * steps_per_unit[axis]).round() as i64
        }))
    }

    /// Motor step deltas for a planner-space step delta.
    fn step_deltas(&self, delta: [i64; NUM_AXES]) -> [i64; NUM_AXES] {
        delta
    }
}

/// Cartesian kinematics (most common 3D printer type)
#[derive(Debug, Clone, Default)]
pub struct CartesianKinematics;

impl Kinematics for CartesianKinematics {
    fn kind(&self) -> KinematicsType {
        KinematicsType::Cartesian
    }

    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        Ok(*cartesian)
    }

    fn motors_to_cartesian(&self, motors: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        Ok(*motors)
    }
}

/// CoreXY / H-bot kinematics
#[derive(Debug, Clone, Default)]
pub struct CoreXYKinematics;

impl Kinematics for CoreXYKinematics {
    fn kind(&self) -> KinematicsType {
        KinematicsType::CoreXY
    }

    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        // A = X + Y, B = X - Y
        Ok([cartesian[0] + cartesian[1], cartesian[0] - cartesian[1], cartesian[2]])
    }

    fn motors_to_cartesian(&self, motors: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        Ok([(motors[0] + motors[1]) / 2.0, (motors[0] - motors[1]) / 2.0, motors[2]])
    }

    fn step_deltas(&self, delta: [i64; NUM_AXES]) -> [i64; NUM_AXES] {
        [delta[0] + delta[1], delta[0] - delta[1], delta[2], delta[3]]
    }
}

/// Linear delta with three towers at 210°, 330° and 90°.
#[derive(Debug, Clone)]
pub struct DeltaKinematics {
    diagonal_rod: f64,
    towers: [[f64; 2]; 3],
}

impl DeltaKinematics {
    pub fn new(diagonal_rod: f64, radius: f64) -> Self {
        let tower = |degrees: f64| {
            let angle = degrees.to_radians();
            [radius * angle.cos(), radius * angle.sin()]
        };
        Self {
            diagonal_rod,
            towers: [tower(210.0), tower(330.0), tower(90.0)],
        }
    }
}

impl Kinematics for DeltaKinematics {
    fn kind(&self) -> KinematicsType {
        KinematicsType::Delta
    }

    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        let rod_sq = self.diagonal_rod * self.diagonal_rod;
        let mut carriages = [0.0; 3];
        for (carriage, tower) in carriages.iter_mut().zip(self.towers.iter()) {
            let dx = cartesian[0] - tower[0];
            let dy = cartesian[1] - tower[1];
            let reach = rod_sq - dx * dx - dy * dy;
            if reach < 0.0 {
                return Err(MotionError::Kinematics(format!(
                    "point ({:.3}, {:.3}) is out of reach of the delta arms",
                    cartesian[0], cartesian[1]
                )));
            }
            *carriage = cartesian[2] + reach.sqrt();
        }
        Ok(carriages)
    }

    fn motors_to_cartesian(&self, motors: &[f64; 3]) -> Result<[f64; 3], MotionError> {
        // Trilateration of three spheres of radius `diagonal_rod` centred on the carriages.
        let p = |i: usize| [self.towers[i][0], self.towers[i][1], motors[i]];
        let (p1, p2, p3) = (p(0), p(1), p(2));

        let p21 = sub(&p2, &p1);
        let d = norm(&p21);
        if d == 0.0 {
            return Err(MotionError::Kinematics("degenerate tower geometry".to_string()));
        }
        let ex = scale(&p21, 1.0 / d);
        let p31 = sub(&p3, &p1);
        let i = dot(&ex, &p31);
        let ey_raw = sub(&p31, &scale(&ex, i));
        let ey_len = norm(&ey_raw);
        if ey_len == 0.0 {
            return Err(MotionError::Kinematics("degenerate tower geometry".to_string()));
        }
        let ey = scale(&ey_raw, 1.0 / ey_len);
        let ez = cross(&ex, &ey);
        let j = dot(&ey, &p31);

        let x = d / 2.0;
        let y = (i * i + j * j - 2.0 * i * x) / (2.0 * j);
        let z_sq = self.diagonal_rod * self.diagonal_rod - x * x - y * y;
        if z_sq < 0.0 {
            return Err(MotionError::Kinematics(format!(
                "carriage heights {:?} do not meet at a point",
                motors
            )));
        }
        let base = add(&p1, &add(&scale(&ex, x), &scale(&ey, y)));
        let up = add(&base, &scale(&ez, z_sq.sqrt()));
        let down = sub(&base, &scale(&ez, z_sq.sqrt()));
        // The effector hangs below the carriages.
        Ok(if up[2] < down[2] { up } else { down })
    }

    fn target_steps(
        &self,
        target: &[f64; NUM_AXES],
        steps_per_unit: &[f64; NUM_AXES],
    ) -> Result<[i64; NUM_AXES], MotionError> {
        let carriages = self.cartesian_to_motors(&[target[0], target[1], target[2]])?;
        Ok([
            (carriages[0] * steps_per_unit[0]).round() as i64,
            (carriages[1] * steps_per_unit[1]).round() as i64,
            (carriages[2] * steps_per_unit[2]).round() as i64,
            (target[3] * steps_per_unit[3]).round() as i64,
        ])
    }
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: &[f64; 3], k: f64) -> [f64; 3] {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

/// Cartesian position in mm for coprocessor motor positions in steps.
pub fn motors_to_position_mm(
    kinematics: &dyn Kinematics,
    motor_steps: &[i32; NUM_AXES],
    steps_per_unit: &[f64; NUM_AXES],
) -> Result<[f64; NUM_AXES], MotionError> {
    let motors = [
        f64::from(motor_steps[0]) / steps_per_unit[0],
        f64::from(motor_steps[1]) / steps_per_unit[1],
        f64::from(motor_steps[2]) / steps_per_unit[2],
    ];
    let [x, y, z] = kinematics.motors_to_cartesian(&motors)?;
    Ok([x, y, z, f64::from(motor_steps[3]) / steps_per_unit[3]])
}

/// Factory for creating kinematics handlers
pub fn create_kinematics(config: &KinematicConfig) -> Box<dyn Kinematics> {
    match config.kinematics {
        KinematicsType::Cartesian => Box::new(CartesianKinematics),
        KinematicsType::CoreXY => Box::new(CoreXYKinematics),
        KinematicsType::Delta => Box::new(DeltaKinematics::new(
            config.delta_diagonal_rod,
            config.delta_radius,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64; 3], b: &[f64; 3]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn corexy_mixes_x_and_y_deltas() {
        let k = CoreXYKinematics;
        assert_eq!(k.step_deltas([100, 40, 0, 7]), [140, 60, 0, 7]);
        assert_eq!(k.step_deltas([0, 50, 0, 0]), [50, -50, 0, 0]);
    }

    #[test]
    fn corexy_round_trips_cartesian() {
        let k = CoreXYKinematics;
        let motors = k.cartesian_to_motors(&[12.0, -3.0, 5.0]).unwrap();
        assert!(close(&k.motors_to_cartesian(&motors).unwrap(), &[12.0, -3.0, 5.0]));
    }

    #[test]
    fn delta_forward_inverts_inverse() {
        let k = DeltaKinematics::new(250.0, 124.0);
        for point in [[0.0, 0.0, 0.0], [30.0, -20.0, 10.0], [-55.5, 40.25, 120.0]] {
            let carriages = k.cartesian_to_motors(&point).unwrap();
            let back = k.motors_to_cartesian(&carriages).unwrap();
            assert!(close(&back, &point), "{:?} -> {:?}", point, back);
        }
    }

    #[test]
    fn delta_rejects_unreachable_points() {
        let k = DeltaKinematics::new(250.0, 124.0);
        assert!(matches!(
            k.cartesian_to_motors(&[500.0, 0.0, 0.0]),
            Err(MotionError::Kinematics(_))
        ));
    }

    #[test]
    fn delta_centre_carriages_are_level() {
        let k = DeltaKinematics::new(250.0, 124.0);
        let carriages = k.cartesian_to_motors(&[0.0, 0.0, 0.0]).unwrap();
        let expected = (250.0f64 * 250.0 - 124.0 * 124.0).sqrt();
        for c in carriages {
            assert!((c - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn position_mm_undoes_scaling() {
        let pos = motors_to_position_mm(&CartesianKinematics, &[800, -160, 400, 95], &[80.0, 80.0, 400.0, 95.0])
            .unwrap();
        assert_eq!(pos, [10.0, -2.0, 1.0, 1.0]);
    }
}
