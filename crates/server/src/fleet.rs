//! Fleet view: stored robots joined with device presence

use std::collections::BTreeMap;

use armdock_protocol::{FleetSnapshot, Robot, RobotStatus, RobotView};

/// Attached device id to description, replaced whole on every poll tick.
pub type PresenceSnapshot = BTreeMap<String, String>;

/// Online iff the robot's device is attached right now.
pub fn robot_status(robot: &Robot, presence: &PresenceSnapshot) -> RobotStatus {
    if presence.contains_key(&robot.com_port) {
        RobotStatus::Online
    } else {
        RobotStatus::Offline
    }
}

pub fn robot_view(robot: Robot, presence: &PresenceSnapshot) -> RobotView {
    let status = robot_status(&robot, presence);
    RobotView { robot, status }
}

pub fn compute_fleet(robots: Vec<Robot>, presence: &PresenceSnapshot) -> FleetSnapshot {
    FleetSnapshot {
        robots: robots
            .into_iter()
            .map(|robot| robot_view(robot, presence))
            .collect(),
        ports: presence.clone(),
    }
}

/// Robots whose device appeared between two snapshots.
pub fn newly_online<'a>(
    robots: &'a [Robot],
    previous: &PresenceSnapshot,
    current: &PresenceSnapshot,
) -> impl Iterator<Item = &'a Robot> + 'a {
    let appeared: Vec<String> = current
        .keys()
        .filter(|port| !previous.contains_key(*port))
        .cloned()
        .collect();
    robots
        .iter()
        .filter(move |robot| appeared.contains(&robot.com_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armdock_protocol::RobotRole;

    fn robot(id: &str, port: &str) -> Robot {
        Robot {
            id: id.to_string(),
            name: id.to_string(),
            model: "so101".to_string(),
            role: RobotRole::Follower,
            com_port: port.to_string(),
            has_calibration: false,
            calibration: None,
            last_seen: None,
        }
    }

    fn presence(ports: &[&str]) -> PresenceSnapshot {
        ports
            .iter()
            .map(|p| (p.to_string(), format!("desc {p}")))
            .collect()
    }

    #[test]
    fn status_follows_presence() {
        let robots = vec![robot("a", "/dev/ttyACM0"), robot("b", "/dev/ttyACM1")];
        let fleet = compute_fleet(robots, &presence(&["/dev/ttyACM1"]));
        assert_eq!(fleet.robots[0].status, RobotStatus::Offline);
        assert_eq!(fleet.robots[1].status, RobotStatus::Online);
        assert_eq!(fleet.ports.len(), 1);
    }

    #[test]
    fn newly_online_ignores_devices_that_stayed() {
        let robots = vec![robot("a", "/dev/ttyACM0"), robot("b", "/dev/ttyACM1")];
        let before = presence(&["/dev/ttyACM0"]);
        let after = presence(&["/dev/ttyACM0", "/dev/ttyACM1"]);
        let ids: Vec<_> = newly_online(&robots, &before, &after)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }
}
